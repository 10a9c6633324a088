//! Borrow transaction domain module (event-sourced).
//!
//! Owns the per-request lifecycle: `Pending → Approved → Borrowed →
//! Returned`, with `Cancelled` reachable from the first two states and
//! `Overdue` as a sweep-applied label on late `Borrowed` transactions.
//! Ledger mutations happen only as side effects of these transitions,
//! orchestrated by the service layer in `stockroom-infra`.

pub mod sweep;
pub mod transaction;

pub use sweep::{overdue_promotions, promotion_due};
pub use transaction::{
    Approve, BorrowCommand, BorrowEvent, BorrowStatus, BorrowTransaction, Cancel, FellOverdue,
    ItemPickedUp, ItemReturned, MarkBorrowed, MarkOverdue, MarkReturned, OpenRequest, Reject,
    RequestApproved, RequestCancelled, RequestOpened, RequestRejected, TransactionId,
};
