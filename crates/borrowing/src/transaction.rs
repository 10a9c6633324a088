use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use stockroom_events::Event;
use stockroom_inventory::{ItemCondition, ItemId};

/// Borrow transaction identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub AggregateId);

impl TransactionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Borrow request lifecycle status.
///
/// `Overdue` is a transient label on late `Borrowed` transactions; it is
/// removed implicitly by the transition to `Returned`. Rejection lands in
/// `Cancelled` — staff notes distinguish the two in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorrowStatus {
    Pending,
    Approved,
    Borrowed,
    Returned,
    Overdue,
    Cancelled,
}

impl BorrowStatus {
    /// Terminal states accept no further transitions, including the sweep.
    pub fn is_terminal(self) -> bool {
        matches!(self, BorrowStatus::Returned | BorrowStatus::Cancelled)
    }
}

impl core::fmt::Display for BorrowStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            BorrowStatus::Pending => "pending",
            BorrowStatus::Approved => "approved",
            BorrowStatus::Borrowed => "borrowed",
            BorrowStatus::Returned => "returned",
            BorrowStatus::Overdue => "overdue",
            BorrowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregate root: BorrowTransaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowTransaction {
    id: TransactionId,
    item_id: ItemId,
    borrower: UserId,
    quantity: u32,
    purpose: String,
    due_date: DateTime<Utc>,
    created_at: DateTime<Utc>,
    status: BorrowStatus,
    approved_by: Option<UserId>,
    borrowed_at: Option<DateTime<Utc>>,
    returned_at: Option<DateTime<Utc>>,
    return_condition: Option<ItemCondition>,
    notes: Option<String>,
    version: u64,
    created: bool,
}

impl BorrowTransaction {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    ///
    /// Placeholder fields are overwritten by the `RequestOpened` event; the
    /// `created` flag guards against reading them before that.
    pub fn empty(id: TransactionId) -> Self {
        Self {
            id,
            item_id: ItemId::new(AggregateId::from_uuid(uuid::Uuid::nil())),
            borrower: UserId::from_uuid(uuid::Uuid::nil()),
            quantity: 0,
            purpose: String::new(),
            due_date: DateTime::<Utc>::MIN_UTC,
            created_at: DateTime::<Utc>::MIN_UTC,
            status: BorrowStatus::Pending,
            approved_by: None,
            borrowed_at: None,
            returned_at: None,
            return_condition: None,
            notes: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransactionId {
        self.id
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn borrower(&self) -> UserId {
        self.borrower
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn due_date(&self) -> DateTime<Utc> {
        self.due_date
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> BorrowStatus {
        self.status
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn borrowed_at(&self) -> Option<DateTime<Utc>> {
        self.borrowed_at
    }

    pub fn returned_at(&self) -> Option<DateTime<Utc>> {
        self.returned_at
    }

    pub fn return_condition(&self) -> Option<ItemCondition> {
        self.return_condition
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn exists(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for BorrowTransaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenRequest (borrower).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub borrower: UserId,
    pub quantity: u32,
    pub purpose: String,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve (staff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approve {
    pub transaction_id: TransactionId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Reject (staff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub transaction_id: TransactionId,
    pub rejected_by: UserId,
    pub notes: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkBorrowed — physical pickup of already-reserved stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkBorrowed {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel (borrower or staff; ownership is checked by the caller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub transaction_id: TransactionId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReturned {
    pub transaction_id: TransactionId,
    pub condition: ItemCondition,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOverdue — applied by the sweep, never by a caller directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOverdue {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorrowCommand {
    OpenRequest(OpenRequest),
    Approve(Approve),
    Reject(Reject),
    MarkBorrowed(MarkBorrowed),
    Cancel(Cancel),
    MarkReturned(MarkReturned),
    MarkOverdue(MarkOverdue),
}

/// Event: RequestOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOpened {
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub borrower: UserId,
    pub quantity: u32,
    pub purpose: String,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestApproved {
    pub transaction_id: TransactionId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub transaction_id: TransactionId,
    pub rejected_by: UserId,
    pub notes: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemPickedUp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPickedUp {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub transaction_id: TransactionId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReturned {
    pub transaction_id: TransactionId,
    pub condition: ItemCondition,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: FellOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FellOverdue {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorrowEvent {
    RequestOpened(RequestOpened),
    RequestApproved(RequestApproved),
    RequestRejected(RequestRejected),
    ItemPickedUp(ItemPickedUp),
    RequestCancelled(RequestCancelled),
    ItemReturned(ItemReturned),
    FellOverdue(FellOverdue),
}

impl Event for BorrowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BorrowEvent::RequestOpened(_) => "borrowing.request.opened",
            BorrowEvent::RequestApproved(_) => "borrowing.request.approved",
            BorrowEvent::RequestRejected(_) => "borrowing.request.rejected",
            BorrowEvent::ItemPickedUp(_) => "borrowing.item.picked_up",
            BorrowEvent::RequestCancelled(_) => "borrowing.request.cancelled",
            BorrowEvent::ItemReturned(_) => "borrowing.item.returned",
            BorrowEvent::FellOverdue(_) => "borrowing.request.fell_overdue",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BorrowEvent::RequestOpened(e) => e.occurred_at,
            BorrowEvent::RequestApproved(e) => e.occurred_at,
            BorrowEvent::RequestRejected(e) => e.occurred_at,
            BorrowEvent::ItemPickedUp(e) => e.occurred_at,
            BorrowEvent::RequestCancelled(e) => e.occurred_at,
            BorrowEvent::ItemReturned(e) => e.occurred_at,
            BorrowEvent::FellOverdue(e) => e.occurred_at,
        }
    }
}

impl Aggregate for BorrowTransaction {
    type Command = BorrowCommand;
    type Event = BorrowEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BorrowEvent::RequestOpened(e) => {
                self.id = e.transaction_id;
                self.item_id = e.item_id;
                self.borrower = e.borrower;
                self.quantity = e.quantity;
                self.purpose = e.purpose.clone();
                self.due_date = e.due_date;
                self.created_at = e.occurred_at;
                self.status = BorrowStatus::Pending;
                self.created = true;
            }
            BorrowEvent::RequestApproved(e) => {
                self.status = BorrowStatus::Approved;
                self.approved_by = Some(e.approved_by);
            }
            BorrowEvent::RequestRejected(e) => {
                self.status = BorrowStatus::Cancelled;
                self.notes = Some(e.notes.clone());
            }
            BorrowEvent::ItemPickedUp(e) => {
                self.status = BorrowStatus::Borrowed;
                self.borrowed_at = Some(e.occurred_at);
            }
            BorrowEvent::RequestCancelled(_) => {
                self.status = BorrowStatus::Cancelled;
            }
            BorrowEvent::ItemReturned(e) => {
                self.status = BorrowStatus::Returned;
                self.returned_at = Some(e.occurred_at);
                self.return_condition = Some(e.condition);
                if e.notes.is_some() {
                    self.notes = e.notes.clone();
                }
            }
            BorrowEvent::FellOverdue(_) => {
                self.status = BorrowStatus::Overdue;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BorrowCommand::OpenRequest(cmd) => self.handle_open(cmd),
            BorrowCommand::Approve(cmd) => self.handle_approve(cmd),
            BorrowCommand::Reject(cmd) => self.handle_reject(cmd),
            BorrowCommand::MarkBorrowed(cmd) => self.handle_mark_borrowed(cmd),
            BorrowCommand::Cancel(cmd) => self.handle_cancel(cmd),
            BorrowCommand::MarkReturned(cmd) => self.handle_mark_returned(cmd),
            BorrowCommand::MarkOverdue(cmd) => self.handle_mark_overdue(cmd),
        }
    }
}

impl BorrowTransaction {
    fn ensure_exists(&self, transaction_id: TransactionId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != transaction_id {
            return Err(DomainError::validation("transaction_id mismatch"));
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenRequest) -> Result<Vec<BorrowEvent>, DomainError> {
        if self.created {
            return Err(DomainError::validation("transaction already exists"));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::invalid_quantity(
                "requested quantity must be at least 1",
            ));
        }
        if cmd.due_date <= cmd.occurred_at {
            return Err(DomainError::validation(
                "expected return date must be in the future",
            ));
        }
        if cmd.purpose.trim().is_empty() {
            return Err(DomainError::validation("purpose cannot be empty"));
        }

        Ok(vec![BorrowEvent::RequestOpened(RequestOpened {
            transaction_id: cmd.transaction_id,
            item_id: cmd.item_id,
            borrower: cmd.borrower,
            quantity: cmd.quantity,
            purpose: cmd.purpose.clone(),
            due_date: cmd.due_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &Approve) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        if self.status != BorrowStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "cannot approve a {} request",
                self.status
            )));
        }

        Ok(vec![BorrowEvent::RequestApproved(RequestApproved {
            transaction_id: cmd.transaction_id,
            approved_by: cmd.approved_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &Reject) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        if self.status != BorrowStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "cannot reject a {} request",
                self.status
            )));
        }

        Ok(vec![BorrowEvent::RequestRejected(RequestRejected {
            transaction_id: cmd.transaction_id,
            rejected_by: cmd.rejected_by,
            notes: cmd.notes.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_borrowed(&self, cmd: &MarkBorrowed) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        if self.status != BorrowStatus::Approved {
            return Err(DomainError::invalid_transition(format!(
                "cannot hand out a {} request",
                self.status
            )));
        }

        Ok(vec![BorrowEvent::ItemPickedUp(ItemPickedUp {
            transaction_id: cmd.transaction_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        // Once stock has physically left the stockroom, cancellation is no
        // longer a valid exit; the item must come back through a return.
        if !matches!(self.status, BorrowStatus::Pending | BorrowStatus::Approved) {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel a {} request",
                self.status
            )));
        }

        Ok(vec![BorrowEvent::RequestCancelled(RequestCancelled {
            transaction_id: cmd.transaction_id,
            cancelled_by: cmd.cancelled_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_returned(&self, cmd: &MarkReturned) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        if !matches!(self.status, BorrowStatus::Borrowed | BorrowStatus::Overdue) {
            return Err(DomainError::invalid_transition(format!(
                "cannot return a {} request",
                self.status
            )));
        }

        Ok(vec![BorrowEvent::ItemReturned(ItemReturned {
            transaction_id: cmd.transaction_id,
            condition: cmd.condition,
            notes: cmd.notes.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_overdue(&self, cmd: &MarkOverdue) -> Result<Vec<BorrowEvent>, DomainError> {
        self.ensure_exists(cmd.transaction_id)?;

        if self.status != BorrowStatus::Borrowed {
            return Err(DomainError::invalid_transition(format!(
                "cannot mark a {} request overdue",
                self.status
            )));
        }
        if self.due_date >= cmd.occurred_at {
            return Err(DomainError::invalid_transition(
                "due date has not passed yet",
            ));
        }

        Ok(vec![BorrowEvent::FellOverdue(FellOverdue {
            transaction_id: cmd.transaction_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_txn_id() -> TransactionId {
        TransactionId::new(AggregateId::new())
    }

    fn test_item_id() -> ItemId {
        ItemId::new(AggregateId::new())
    }

    fn test_user() -> UserId {
        UserId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn open_request(due_in_days: i64) -> BorrowTransaction {
        let id = test_txn_id();
        let mut txn = BorrowTransaction::empty(id);
        let now = test_time();
        let cmd = OpenRequest {
            transaction_id: id,
            item_id: test_item_id(),
            borrower: test_user(),
            quantity: 2,
            purpose: "Chemistry lab session".to_string(),
            due_date: now + Duration::days(due_in_days),
            occurred_at: now,
        };
        let events = txn.handle(&BorrowCommand::OpenRequest(cmd)).unwrap();
        txn.apply(&events[0]);
        txn
    }

    fn run(txn: &mut BorrowTransaction, cmd: BorrowCommand) -> Result<(), DomainError> {
        let events = txn.handle(&cmd)?;
        for e in &events {
            txn.apply(e);
        }
        Ok(())
    }

    fn approve(txn: &mut BorrowTransaction, staff: UserId) {
        let cmd = BorrowCommand::Approve(Approve {
            transaction_id: txn.id_typed(),
            approved_by: staff,
            occurred_at: test_time(),
        });
        run(txn, cmd).unwrap();
    }

    #[test]
    fn open_request_starts_pending() {
        let txn = open_request(7);
        assert_eq!(txn.status(), BorrowStatus::Pending);
        assert_eq!(txn.quantity(), 2);
        assert!(txn.approved_by().is_none());
    }

    #[test]
    fn open_request_rejects_past_due_date() {
        let id = test_txn_id();
        let txn = BorrowTransaction::empty(id);
        let now = test_time();
        let err = txn
            .handle(&BorrowCommand::OpenRequest(OpenRequest {
                transaction_id: id,
                item_id: test_item_id(),
                borrower: test_user(),
                quantity: 1,
                purpose: "Field trip".to_string(),
                due_date: now - Duration::days(1),
                occurred_at: now,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn open_request_rejects_zero_quantity() {
        let id = test_txn_id();
        let txn = BorrowTransaction::empty(id);
        let now = test_time();
        let err = txn
            .handle(&BorrowCommand::OpenRequest(OpenRequest {
                transaction_id: id,
                item_id: test_item_id(),
                borrower: test_user(),
                quantity: 0,
                purpose: "Field trip".to_string(),
                due_date: now + Duration::days(3),
                occurred_at: now,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidQuantity(_)));
    }

    #[test]
    fn approve_records_the_approver() {
        let mut txn = open_request(7);
        let staff = test_user();
        approve(&mut txn, staff);

        assert_eq!(txn.status(), BorrowStatus::Approved);
        assert_eq!(txn.approved_by(), Some(staff));
    }

    #[test]
    fn approve_twice_is_an_invalid_transition() {
        let mut txn = open_request(7);
        approve(&mut txn, test_user());

        let err = txn
            .handle(&BorrowCommand::Approve(Approve {
                transaction_id: txn.id_typed(),
                approved_by: test_user(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn reject_lands_in_cancelled_with_notes() {
        let mut txn = open_request(7);
        let cmd = BorrowCommand::Reject(Reject {
            transaction_id: txn.id_typed(),
            rejected_by: test_user(),
            notes: "Out for maintenance".to_string(),
            occurred_at: test_time(),
        });
        run(&mut txn, cmd).unwrap();

        assert_eq!(txn.status(), BorrowStatus::Cancelled);
        assert_eq!(txn.notes(), Some("Out for maintenance"));
    }

    #[test]
    fn reject_after_approval_is_invalid() {
        let mut txn = open_request(7);
        approve(&mut txn, test_user());

        let err = txn
            .handle(&BorrowCommand::Reject(Reject {
                transaction_id: txn.id_typed(),
                rejected_by: test_user(),
                notes: String::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn pickup_requires_approval_first() {
        let txn = open_request(7);
        let err = txn
            .handle(&BorrowCommand::MarkBorrowed(MarkBorrowed {
                transaction_id: txn.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn cancel_is_allowed_from_pending_and_approved_only() {
        let mut pending = open_request(7);
        let cmd = BorrowCommand::Cancel(Cancel {
            transaction_id: pending.id_typed(),
            cancelled_by: pending.borrower(),
            occurred_at: test_time(),
        });
        run(&mut pending, cmd).unwrap();
        assert_eq!(pending.status(), BorrowStatus::Cancelled);

        let mut approved = open_request(7);
        approve(&mut approved, test_user());
        let cmd = BorrowCommand::Cancel(Cancel {
            transaction_id: approved.id_typed(),
            cancelled_by: approved.borrower(),
            occurred_at: test_time(),
        });
        run(&mut approved, cmd).unwrap();
        assert_eq!(approved.status(), BorrowStatus::Cancelled);

        let mut borrowed = open_request(7);
        approve(&mut borrowed, test_user());
        let cmd = BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id: borrowed.id_typed(),
            occurred_at: test_time(),
        });
        run(&mut borrowed, cmd).unwrap();
        let err = borrowed
            .handle(&BorrowCommand::Cancel(Cancel {
                transaction_id: borrowed.id_typed(),
                cancelled_by: borrowed.borrower(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn full_lifecycle_to_returned() {
        let mut txn = open_request(7);
        let staff = test_user();
        approve(&mut txn, staff);

        let borrow = BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id: txn.id_typed(),
            occurred_at: test_time(),
        });
        run(&mut txn, borrow).unwrap();
        assert_eq!(txn.status(), BorrowStatus::Borrowed);
        assert!(txn.borrowed_at().is_some());

        let returned = BorrowCommand::MarkReturned(MarkReturned {
            transaction_id: txn.id_typed(),
            condition: ItemCondition::Good,
            notes: None,
            occurred_at: test_time(),
        });
        run(&mut txn, returned).unwrap();
        assert_eq!(txn.status(), BorrowStatus::Returned);
        assert_eq!(txn.return_condition(), Some(ItemCondition::Good));
        assert!(txn.returned_at().is_some());
    }

    #[test]
    fn double_return_is_rejected() {
        let mut txn = open_request(7);
        approve(&mut txn, test_user());
        let borrow = BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id: txn.id_typed(),
            occurred_at: test_time(),
        });
        run(&mut txn, borrow).unwrap();
        let returned = BorrowCommand::MarkReturned(MarkReturned {
            transaction_id: txn.id_typed(),
            condition: ItemCondition::Good,
            notes: None,
            occurred_at: test_time(),
        });
        run(&mut txn, returned).unwrap();

        let err = txn
            .handle(&BorrowCommand::MarkReturned(MarkReturned {
                transaction_id: txn.id_typed(),
                condition: ItemCondition::Good,
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn overdue_transaction_can_still_be_returned() {
        let mut txn = open_request(1);
        approve(&mut txn, test_user());
        let borrow = BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id: txn.id_typed(),
            occurred_at: test_time(),
        });
        run(&mut txn, borrow).unwrap();

        let overdue = BorrowCommand::MarkOverdue(MarkOverdue {
            transaction_id: txn.id_typed(),
            occurred_at: txn.due_date() + Duration::days(1),
        });
        run(&mut txn, overdue).unwrap();
        assert_eq!(txn.status(), BorrowStatus::Overdue);

        let returned = BorrowCommand::MarkReturned(MarkReturned {
            transaction_id: txn.id_typed(),
            condition: ItemCondition::Fair,
            notes: Some("Returned late".to_string()),
            occurred_at: test_time(),
        });
        run(&mut txn, returned).unwrap();
        assert_eq!(txn.status(), BorrowStatus::Returned);
    }

    #[test]
    fn mark_overdue_requires_a_past_due_date() {
        let mut txn = open_request(7);
        approve(&mut txn, test_user());
        let borrow = BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id: txn.id_typed(),
            occurred_at: test_time(),
        });
        run(&mut txn, borrow).unwrap();

        let err = txn
            .handle(&BorrowCommand::MarkOverdue(MarkOverdue {
                transaction_id: txn.id_typed(),
                occurred_at: txn.due_date() - Duration::days(1),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn mark_overdue_from_pending_is_invalid() {
        let txn = open_request(7);
        let err = txn
            .handle(&BorrowCommand::MarkOverdue(MarkOverdue {
                transaction_id: txn.id_typed(),
                occurred_at: txn.due_date() + Duration::days(1),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let txn = open_request(7);
        let before = txn.clone();

        let cmd = BorrowCommand::Approve(Approve {
            transaction_id: txn.id_typed(),
            approved_by: test_user(),
            occurred_at: test_time(),
        });
        let events1 = txn.handle(&cmd).unwrap();
        let events2 = txn.handle(&cmd).unwrap();

        assert_eq!(txn, before);
        assert_eq!(events1, events2);
    }

    #[test]
    fn version_increments_on_apply() {
        let mut txn = open_request(7);
        assert_eq!(txn.version(), 1);
        approve(&mut txn, test_user());
        assert_eq!(txn.version(), 2);
    }
}
