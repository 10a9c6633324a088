//! Borrow service: application-level orchestration.
//!
//! This is the single entry point callers use. It composes the two domain
//! aggregates with the event store and the observer ports:
//!
//! ```text
//! caller (Principal + now)
//!   ↓
//! authorize → sweep → per-item lock → guard both aggregates → append → publish
//!                                                               ↓
//!                                              audit sink / overdue notifier
//! ```
//!
//! Consistency rules enforced here:
//!
//! - Every operation that mutates an item's counters *or any transaction on
//!   that item* holds that item's exclusive lock across check + append. The
//!   critical section is bounded and does no IO. Different items never
//!   contend.
//! - For transitions spanning both aggregates (approve, cancel of an
//!   approved request, return) both `handle` guards run on freshly
//!   rehydrated state before either stream is appended — all-or-nothing on
//!   every error path.
//! - The store's optimistic concurrency check backs the lock discipline up;
//!   a lost race surfaces as `ConcurrentModification`, never as corrupted
//!   counters, and is never retried here.
//! - Audit, notification and bus delivery failures are logged and
//!   discarded; they must not fail the business transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockroom_auth::{AuthzError, Permission, Principal, authorize, policy};
use stockroom_borrowing::{
    Approve, BorrowCommand, BorrowStatus, BorrowTransaction, Cancel, MarkBorrowed, MarkOverdue,
    MarkReturned, OpenRequest, Reject, TransactionId, sweep,
};
use stockroom_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, UserId};
use stockroom_events::{Event, EventBus, EventEnvelope};
use stockroom_inventory::{
    CreateItem, InventoryCommand, InventoryItem, ItemCondition, ItemDetails, ItemId, Release,
    Reserve, Resize, SetCondition, UpdateDetails,
};

use crate::audit::{AuditActor, AuditEvent, AuditSink};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::notify::{OverdueNotice, OverdueNotifier};

const ITEM_AGGREGATE: &str = "inventory.item";
const TRANSACTION_AGGREGATE: &str = "borrowing.transaction";

/// Service-level error: the domain taxonomy, or an infrastructure failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(DomainError),

    /// Failed to deserialize a stored event payload.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error("event store failure: {0}")]
    Store(EventStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        ServiceError::Domain(value)
    }
}

impl From<EventStoreError> for ServiceError {
    fn from(value: EventStoreError) -> Self {
        match value {
            // A version conflict is a lost per-item race: part of the domain
            // taxonomy, reported to the caller who may re-read and retry.
            EventStoreError::Concurrency(msg) => {
                ServiceError::Domain(DomainError::concurrent_modification(msg))
            }
            other => ServiceError::Store(other),
        }
    }
}

impl From<AuthzError> for ServiceError {
    fn from(_: AuthzError) -> Self {
        ServiceError::Domain(DomainError::Unauthorized)
    }
}

impl ServiceError {
    /// The domain-taxonomy view of this error, if it has one.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            ServiceError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// Input for staff item creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub code: String,
    pub details: ItemDetails,
    pub condition: ItemCondition,
    pub quantity_total: u32,
}

/// Caller-facing snapshot of an inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    pub item_id: ItemId,
    pub code: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub location: String,
    pub condition: ItemCondition,
    pub borrowable: bool,
    pub quantity_total: u32,
    pub quantity_available: u32,
    pub quantity_borrowed: u32,
}

impl From<&InventoryItem> for ItemView {
    fn from(item: &InventoryItem) -> Self {
        let details = item.details();
        Self {
            item_id: item.id_typed(),
            code: item.code().to_string(),
            name: details.name.clone(),
            category: details.category.clone(),
            description: details.description.clone(),
            location: details.location.clone(),
            condition: item.condition(),
            borrowable: details.borrowable,
            quantity_total: item.quantity_total(),
            quantity_available: item.quantity_available(),
            quantity_borrowed: item.quantity_borrowed(),
        }
    }
}

/// Caller-facing snapshot of a borrow transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionView {
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub borrower: UserId,
    pub quantity: u32,
    pub purpose: String,
    pub status: BorrowStatus,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<UserId>,
    pub borrowed_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub return_condition: Option<ItemCondition>,
    pub notes: Option<String>,
}

impl From<&BorrowTransaction> for TransactionView {
    fn from(txn: &BorrowTransaction) -> Self {
        Self {
            transaction_id: txn.id_typed(),
            item_id: txn.item_id(),
            borrower: txn.borrower(),
            quantity: txn.quantity(),
            purpose: txn.purpose().to_string(),
            status: txn.status(),
            due_date: txn.due_date(),
            created_at: txn.created_at(),
            approved_by: txn.approved_by(),
            borrowed_at: txn.borrowed_at(),
            returned_at: txn.returned_at(),
            return_condition: txn.return_condition(),
            notes: txn.notes().map(str::to_string),
        }
    }
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub item_id: Option<ItemId>,
    pub borrower: Option<UserId>,
    pub status: Option<BorrowStatus>,
}

impl TransactionFilter {
    fn matches(&self, txn: &BorrowTransaction) -> bool {
        self.item_id.is_none_or(|id| txn.item_id() == id)
            && self.borrower.is_none_or(|b| txn.borrower() == b)
            && self.status.is_none_or(|s| txn.status() == s)
    }
}

/// Cross-aggregate bookkeeping: which streams exist and how they relate.
/// Derivable from the event store; kept in memory for direct lookup.
#[derive(Debug, Default)]
struct Index {
    item_codes: HashMap<String, ItemId>,
    items: Vec<ItemId>,
    transactions: Vec<TransactionId>,
    transaction_items: HashMap<TransactionId, ItemId>,
    item_transactions: HashMap<ItemId, Vec<TransactionId>>,
}

/// The borrow transaction engine.
///
/// Generic over the event store and bus so tests and future backends can
/// swap implementations without touching the orchestration.
pub struct BorrowService<S, B> {
    store: S,
    bus: B,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn OverdueNotifier>,
    index: RwLock<Index>,
    item_locks: Mutex<HashMap<ItemId, Arc<Mutex<()>>>>,
}

impl<S, B> BorrowService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        store: S,
        bus: B,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn OverdueNotifier>,
    ) -> Self {
        Self {
            store,
            bus,
            audit,
            notifier,
            index: RwLock::new(Index::default()),
            item_locks: Mutex::new(HashMap::new()),
        }
    }

    // ── staff: inventory management ─────────────────────────────────────

    pub fn create_item(
        &self,
        principal: &Principal,
        new_item: NewItem,
        now: DateTime<Utc>,
    ) -> Result<ItemView, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_MANAGE))?;

        let code = new_item.code.trim().to_string();

        // Code uniqueness is a cross-aggregate concern; the index write
        // lock is the critical section for it.
        let mut index = self
            .index
            .write()
            .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;

        if index.item_codes.contains_key(&code) {
            return Err(DomainError::validation(format!("item code '{code}' already exists")).into());
        }

        let item_id = ItemId::new(AggregateId::new());
        let mut item = InventoryItem::empty(item_id);
        let events = item.handle(&InventoryCommand::CreateItem(CreateItem {
            item_id,
            code: code.clone(),
            details: new_item.details,
            condition: new_item.condition,
            quantity_total: new_item.quantity_total,
            occurred_at: now,
        }))?;

        self.append_and_publish(item_id.0, ITEM_AGGREGATE, &events, ExpectedVersion::Exact(0))?;
        for e in &events {
            item.apply(e);
        }

        index.item_codes.insert(code, item_id);
        index.items.push(item_id);

        Ok(ItemView::from(&item))
    }

    pub fn update_item_details(
        &self,
        principal: &Principal,
        item_id: ItemId,
        details: ItemDetails,
        now: DateTime<Utc>,
    ) -> Result<ItemView, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_MANAGE))?;

        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut item, version) = self.load_item(item_id)?;
        let events = item.handle(&InventoryCommand::UpdateDetails(UpdateDetails {
            item_id,
            details,
            occurred_at: now,
        }))?;
        self.append_and_publish(
            item_id.0,
            ITEM_AGGREGATE,
            &events,
            ExpectedVersion::Exact(version),
        )?;
        for e in &events {
            item.apply(e);
        }

        Ok(ItemView::from(&item))
    }

    pub fn resize_item(
        &self,
        principal: &Principal,
        item_id: ItemId,
        new_total: u32,
        now: DateTime<Utc>,
    ) -> Result<ItemView, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_MANAGE))?;

        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut item, version) = self.load_item(item_id)?;
        let events = item.handle(&InventoryCommand::Resize(Resize {
            item_id,
            new_total,
            occurred_at: now,
        }))?;
        self.append_and_publish(
            item_id.0,
            ITEM_AGGREGATE,
            &events,
            ExpectedVersion::Exact(version),
        )?;
        for e in &events {
            item.apply(e);
        }

        Ok(ItemView::from(&item))
    }

    pub fn set_item_condition(
        &self,
        principal: &Principal,
        item_id: ItemId,
        condition: ItemCondition,
        now: DateTime<Utc>,
    ) -> Result<ItemView, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_MANAGE))?;

        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut item, version) = self.load_item(item_id)?;
        let events = item.handle(&InventoryCommand::SetCondition(SetCondition {
            item_id,
            condition,
            occurred_at: now,
        }))?;
        self.append_and_publish(
            item_id.0,
            ITEM_AGGREGATE,
            &events,
            ExpectedVersion::Exact(version),
        )?;
        for e in &events {
            item.apply(e);
        }

        Ok(ItemView::from(&item))
    }

    // ── borrower: request / cancel ──────────────────────────────────────

    pub fn request(
        &self,
        principal: &Principal,
        item_id: ItemId,
        quantity: u32,
        due_date: DateTime<Utc>,
        purpose: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_REQUEST))?;
        self.run_sweep(now)?;

        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (item, _) = self.load_item(item_id)?;
        if !item.is_borrowable() {
            return Err(DomainError::validation("item is not borrowable").into());
        }
        if quantity > item.quantity_available() {
            return Err(DomainError::invalid_quantity(format!(
                "requested {quantity}, only {} available",
                item.quantity_available()
            ))
            .into());
        }

        // One live request per borrower per item.
        let open = self.transactions_for_item(item_id)?;
        let has_live = open.iter().any(|t| {
            t.borrower() == principal.user_id
                && matches!(t.status(), BorrowStatus::Pending | BorrowStatus::Approved)
        });
        if has_live {
            return Err(
                DomainError::validation("caller already has an open request for this item").into(),
            );
        }

        let transaction_id = TransactionId::new(AggregateId::new());
        let mut txn = BorrowTransaction::empty(transaction_id);
        let events = txn.handle(&BorrowCommand::OpenRequest(OpenRequest {
            transaction_id,
            item_id,
            borrower: principal.user_id,
            quantity,
            purpose: purpose.into(),
            due_date,
            occurred_at: now,
        }))?;

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &events,
            ExpectedVersion::Exact(0),
        )?;
        for e in &events {
            txn.apply(e);
        }

        {
            let mut index = self
                .index
                .write()
                .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
            index.transactions.push(transaction_id);
            index.transaction_items.insert(transaction_id, item_id);
            index
                .item_transactions
                .entry(item_id)
                .or_default()
                .push(transaction_id);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "request",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    pub fn cancel(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        self.run_sweep(now)?;

        let item_id = self.item_for_transaction(transaction_id)?;
        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut txn, txn_version) = self.load_transaction(transaction_id)?;

        // The owner may cancel their own request; staff may cancel any.
        if txn.borrower() == principal.user_id {
            authorize(principal, &Permission::new(policy::BORROWING_CANCEL_OWN))?;
        } else {
            authorize(principal, &Permission::new(policy::BORROWING_CANCEL_ANY))?;
        }

        // Stock was reserved at approval; only then does cancellation
        // release it.
        let was_approved = txn.status() == BorrowStatus::Approved;

        let txn_events = txn.handle(&BorrowCommand::Cancel(Cancel {
            transaction_id,
            cancelled_by: principal.user_id,
            occurred_at: now,
        }))?;

        let item_changes = if was_approved {
            let (item, item_version) = self.load_item(item_id)?;
            let events = item.handle(&InventoryCommand::Release(Release {
                item_id,
                quantity: txn.quantity(),
                occurred_at: now,
            }))?;
            Some((events, item_version))
        } else {
            None
        };

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &txn_events,
            ExpectedVersion::Exact(txn_version),
        )?;
        if let Some((events, item_version)) = item_changes {
            self.append_and_publish(
                item_id.0,
                ITEM_AGGREGATE,
                &events,
                ExpectedVersion::Exact(item_version),
            )?;
        }
        for e in &txn_events {
            txn.apply(e);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "cancel",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    // ── staff: request review & custody ─────────────────────────────────

    pub fn approve(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_REVIEW))?;
        self.run_sweep(now)?;

        let item_id = self.item_for_transaction(transaction_id)?;
        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut txn, txn_version) = self.load_transaction(transaction_id)?;
        let (item, item_version) = self.load_item(item_id)?;

        // Decide both transitions before touching either stream.
        let txn_events = txn.handle(&BorrowCommand::Approve(Approve {
            transaction_id,
            approved_by: principal.user_id,
            occurred_at: now,
        }))?;
        let item_events = item.handle(&InventoryCommand::Reserve(Reserve {
            item_id,
            quantity: txn.quantity(),
            occurred_at: now,
        }))?;

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &txn_events,
            ExpectedVersion::Exact(txn_version),
        )?;
        self.append_and_publish(
            item_id.0,
            ITEM_AGGREGATE,
            &item_events,
            ExpectedVersion::Exact(item_version),
        )?;
        for e in &txn_events {
            txn.apply(e);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "approve",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    pub fn reject(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        notes: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_REVIEW))?;
        self.run_sweep(now)?;

        let item_id = self.item_for_transaction(transaction_id)?;
        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut txn, txn_version) = self.load_transaction(transaction_id)?;
        let txn_events = txn.handle(&BorrowCommand::Reject(Reject {
            transaction_id,
            rejected_by: principal.user_id,
            notes: notes.into(),
            occurred_at: now,
        }))?;

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &txn_events,
            ExpectedVersion::Exact(txn_version),
        )?;
        for e in &txn_events {
            txn.apply(e);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "reject",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    pub fn mark_borrowed(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_REVIEW))?;
        self.run_sweep(now)?;

        let item_id = self.item_for_transaction(transaction_id)?;
        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut txn, txn_version) = self.load_transaction(transaction_id)?;
        // Stock was already reserved at approval; pickup has no ledger effect.
        let txn_events = txn.handle(&BorrowCommand::MarkBorrowed(MarkBorrowed {
            transaction_id,
            occurred_at: now,
        }))?;

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &txn_events,
            ExpectedVersion::Exact(txn_version),
        )?;
        for e in &txn_events {
            txn.apply(e);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "pickup",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    pub fn mark_returned(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        condition: ItemCondition,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_REVIEW))?;
        self.run_sweep(now)?;

        let item_id = self.item_for_transaction(transaction_id)?;
        let lock = self.item_lock(item_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

        let (mut txn, txn_version) = self.load_transaction(transaction_id)?;
        let (item, item_version) = self.load_item(item_id)?;

        let txn_events = txn.handle(&BorrowCommand::MarkReturned(MarkReturned {
            transaction_id,
            condition,
            notes,
            occurred_at: now,
        }))?;

        let mut item_events = item.handle(&InventoryCommand::Release(Release {
            item_id,
            quantity: txn.quantity(),
            occurred_at: now,
        }))?;
        if condition.is_degraded() {
            item_events.extend(item.handle(&InventoryCommand::SetCondition(SetCondition {
                item_id,
                condition,
                occurred_at: now,
            }))?);
        }

        self.append_and_publish(
            transaction_id.0,
            TRANSACTION_AGGREGATE,
            &txn_events,
            ExpectedVersion::Exact(txn_version),
        )?;
        self.append_and_publish(
            item_id.0,
            ITEM_AGGREGATE,
            &item_events,
            ExpectedVersion::Exact(item_version),
        )?;
        for e in &txn_events {
            txn.apply(e);
        }

        self.record_transition(
            AuditActor::User(principal.user_id),
            "return",
            transaction_id,
            now,
        );
        Ok(TransactionView::from(&txn))
    }

    // ── overdue sweep ───────────────────────────────────────────────────

    /// Promote late `Borrowed` transactions to `Overdue`.
    ///
    /// Pure derived-state recomputation: running it N times is the same as
    /// running it once, and terminal transactions are never touched. Invoked
    /// at the top of every transition and listing operation, and exposed for
    /// explicit invocation.
    pub fn run_sweep(&self, now: DateTime<Utc>) -> Result<Vec<TransactionId>, ServiceError> {
        let candidates: Vec<TransactionId> = {
            let index = self
                .index
                .read()
                .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
            index.transactions.clone()
        };

        let mut promoted = Vec::new();

        for transaction_id in candidates {
            // Cheap pre-check without the lock; re-checked under it.
            let Ok((txn, _)) = self.load_transaction(transaction_id) else {
                continue;
            };
            if !sweep::promotion_due(txn.status(), txn.due_date(), now) {
                continue;
            }

            let item_id = txn.item_id();
            let lock = self.item_lock(item_id)?;
            let _guard = lock
                .lock()
                .map_err(|_| ServiceError::Internal("item lock poisoned".to_string()))?;

            let (mut txn, version) = self.load_transaction(transaction_id)?;
            if !sweep::promotion_due(txn.status(), txn.due_date(), now) {
                continue;
            }

            let events = txn.handle(&BorrowCommand::MarkOverdue(MarkOverdue {
                transaction_id,
                occurred_at: now,
            }))?;
            self.append_and_publish(
                transaction_id.0,
                TRANSACTION_AGGREGATE,
                &events,
                ExpectedVersion::Exact(version),
            )?;
            for e in &events {
                txn.apply(e);
            }

            self.record_transition(AuditActor::System, "overdue", transaction_id, now);

            // Best-effort notification; never propagated.
            let notice = OverdueNotice {
                transaction_id,
                item_id,
                borrower: txn.borrower(),
                due_date: txn.due_date(),
                occurred_at: now,
            };
            if let Err(e) = self.notifier.notify(notice) {
                tracing::warn!(%transaction_id, error = %e, "overdue notification dropped");
            }

            promoted.push(transaction_id);
        }

        Ok(promoted)
    }

    // ── reads ───────────────────────────────────────────────────────────

    pub fn get_item(
        &self,
        principal: &Principal,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<ItemView, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_READ))?;
        self.run_sweep(now)?;

        let (item, _) = self.load_item(item_id)?;
        Ok(ItemView::from(&item))
    }

    pub fn list_items(
        &self,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Vec<ItemView>, ServiceError> {
        authorize(principal, &Permission::new(policy::INVENTORY_READ))?;
        self.run_sweep(now)?;

        let ids: Vec<ItemId> = {
            let index = self
                .index
                .read()
                .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
            index.items.clone()
        };

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            let (item, _) = self.load_item(id)?;
            views.push(ItemView::from(&item));
        }
        Ok(views)
    }

    pub fn get_transaction(
        &self,
        principal: &Principal,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<TransactionView, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_READ))?;
        self.run_sweep(now)?;

        let (txn, _) = self.load_transaction(transaction_id)?;
        if txn.borrower() != principal.user_id {
            // Only reviewers may read other borrowers' transactions.
            authorize(principal, &Permission::new(policy::BORROWING_REVIEW))?;
        }
        Ok(TransactionView::from(&txn))
    }

    pub fn list_transactions(
        &self,
        principal: &Principal,
        filter: TransactionFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransactionView>, ServiceError> {
        authorize(principal, &Permission::new(policy::BORROWING_READ))?;
        self.run_sweep(now)?;

        let can_review =
            authorize(principal, &Permission::new(policy::BORROWING_REVIEW)).is_ok();

        let ids: Vec<TransactionId> = {
            let index = self
                .index
                .read()
                .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
            index.transactions.clone()
        };

        let mut views = Vec::new();
        for id in ids {
            let (txn, _) = self.load_transaction(id)?;
            if !can_review && txn.borrower() != principal.user_id {
                continue;
            }
            if filter.matches(&txn) {
                views.push(TransactionView::from(&txn));
            }
        }
        Ok(views)
    }

    // ── internals ───────────────────────────────────────────────────────

    fn item_lock(&self, item_id: ItemId) -> Result<Arc<Mutex<()>>, ServiceError> {
        let mut locks = self
            .item_locks
            .lock()
            .map_err(|_| ServiceError::Internal("lock registry poisoned".to_string()))?;
        Ok(locks.entry(item_id).or_default().clone())
    }

    fn item_for_transaction(&self, transaction_id: TransactionId) -> Result<ItemId, ServiceError> {
        let index = self
            .index
            .read()
            .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
        index
            .transaction_items
            .get(&transaction_id)
            .copied()
            .ok_or_else(|| DomainError::not_found().into())
    }

    fn transactions_for_item(
        &self,
        item_id: ItemId,
    ) -> Result<Vec<BorrowTransaction>, ServiceError> {
        let ids: Vec<TransactionId> = {
            let index = self
                .index
                .read()
                .map_err(|_| ServiceError::Internal("index lock poisoned".to_string()))?;
            index
                .item_transactions
                .get(&item_id)
                .cloned()
                .unwrap_or_default()
        };

        let mut txns = Vec::with_capacity(ids.len());
        for id in ids {
            let (txn, _) = self.load_transaction(id)?;
            txns.push(txn);
        }
        Ok(txns)
    }

    fn load_item(&self, item_id: ItemId) -> Result<(InventoryItem, u64), ServiceError> {
        let history = self.store.load_stream(item_id.0)?;
        let mut item = InventoryItem::empty(item_id);
        let version = apply_history(&mut item, history)?;
        if !item.exists() {
            return Err(DomainError::not_found().into());
        }
        Ok((item, version))
    }

    fn load_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<(BorrowTransaction, u64), ServiceError> {
        let history = self.store.load_stream(transaction_id.0)?;
        let mut txn = BorrowTransaction::empty(transaction_id);
        let version = apply_history(&mut txn, history)?;
        if !txn.exists() {
            return Err(DomainError::not_found().into());
        }
        Ok((txn, version))
    }

    fn append_and_publish<E>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: &[E],
        expected: ExpectedVersion,
    ) -> Result<(), ServiceError>
    where
        E: Event + Serialize,
    {
        let uncommitted = events
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // Publish after append. The store is the source of truth; a delivery
        // failure must not fail the transition (projections can rebuild).
        for stored in &committed {
            if let Err(e) = self.bus.publish(stored.to_envelope()) {
                tracing::warn!(%aggregate_id, error = ?e, "event publication dropped");
            }
        }

        Ok(())
    }

    fn record_transition(
        &self,
        actor: AuditActor,
        action: &str,
        transaction_id: TransactionId,
        occurred_at: DateTime<Utc>,
    ) {
        let event = AuditEvent {
            actor,
            action: action.to_string(),
            transaction_id,
            occurred_at,
        };
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(%transaction_id, error = %e, "audit record dropped");
        }
    }
}

fn apply_history<A>(aggregate: &mut A, history: Vec<StoredEvent>) -> Result<u64, ServiceError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // Ensure deterministic ordering.
    let mut sorted = history;
    sorted.sort_by_key(|e| e.sequence_number);
    let version = sorted.last().map(|e| e.sequence_number).unwrap_or(0);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| ServiceError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(version)
}
