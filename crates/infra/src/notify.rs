//! Overdue notification boundary (e.g. email to the borrower).
//!
//! Invoked after a successful promotion to `Overdue`. Optional and
//! best-effort: failures are swallowed, never propagated.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockroom_borrowing::TransactionId;
use stockroom_core::UserId;
use stockroom_inventory::ItemId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueNotice {
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub borrower: UserId,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

pub trait OverdueNotifier: Send + Sync {
    fn notify(&self, notice: OverdueNotice) -> Result<(), NotifyError>;
}

/// Notifier that does nothing (notification surface not wired up).
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl OverdueNotifier for NoopNotifier {
    fn notify(&self, _notice: OverdueNotice) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Records notices for inspection in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<OverdueNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<OverdueNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

impl OverdueNotifier for RecordingNotifier {
    fn notify(&self, notice: OverdueNotice) -> Result<(), NotifyError> {
        self.notices
            .lock()
            .map_err(|_| NotifyError::Delivery("lock poisoned".to_string()))?
            .push(notice);
        Ok(())
    }
}
