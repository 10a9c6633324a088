//! Overdue sweep: pure derived-state recomputation.
//!
//! The sweep decides which `Borrowed` transactions have slipped past their
//! expected return date. It is a pure function of (status, due date, now):
//! safe to evaluate on every read, idempotent by construction (a promoted
//! transaction is `Overdue` and no longer matches), and it never looks at
//! transactions in a terminal state. The service layer turns each positive
//! answer into a `MarkOverdue` command.

use chrono::{DateTime, Utc};

use crate::transaction::{BorrowStatus, BorrowTransaction, TransactionId};

/// Does this transaction need promotion to `Overdue` as of `now`?
pub fn promotion_due(status: BorrowStatus, due_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    status == BorrowStatus::Borrowed && due_date < now
}

/// Derive the set of transactions due for promotion.
pub fn overdue_promotions<'a, I>(transactions: I, now: DateTime<Utc>) -> Vec<TransactionId>
where
    I: IntoIterator<Item = &'a BorrowTransaction>,
{
    transactions
        .into_iter()
        .filter(|t| promotion_due(t.status(), t.due_date(), now))
        .map(|t| t.id_typed())
        .collect()
}
