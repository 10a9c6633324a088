use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockroom_core::AggregateId;
use stockroom_events::EventEnvelope;
use stockroom_inventory::{InventoryEvent, ItemCondition, ItemId};

use crate::read_model::ReadStore;

/// Queryable stock view: the `inventory_items` table shape of the
/// surrounding system, derived from the inventory event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub item_id: ItemId,
    pub code: String,
    pub name: String,
    pub category: String,
    pub location: String,
    pub condition: ItemCondition,
    pub borrowable: bool,
    pub quantity_total: u32,
    pub quantity_available: u32,
    pub quantity_borrowed: u32,
}

#[derive(Debug, Error)]
pub enum StockProjectionError {
    #[error("failed to deserialize inventory event: {0}")]
    Deserialize(String),

    #[error("event item_id does not match envelope aggregate_id")]
    AggregateMismatch,

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock levels projection.
///
/// Consumes published envelopes (JSON payloads) and maintains a per-item
/// read model. Read models are disposable and rebuildable from the event
/// stream. Envelopes for non-inventory aggregates are ignored, so the
/// projection can sit on the same bus as the borrowing events.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadStore<ItemId, StockLevel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadStore<ItemId, StockLevel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Query the read model for one item.
    pub fn get(&self, item_id: &ItemId) -> Option<StockLevel> {
        self.store.get(item_id)
    }

    /// List all items (disposable read model).
    pub fn list(&self) -> Vec<StockLevel> {
        self.store.list()
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Ignores envelopes that are not inventory item streams
    /// - Enforces monotonic sequence per aggregate stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockProjectionError> {
        if envelope.aggregate_type() != "inventory.item" {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let Ok(mut cursors) = self.cursors.write() else {
            return Ok(());
        };

        let last = *cursors.get(&aggregate_id).unwrap_or(&0);

        if seq == 0 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }

        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }

        if last != 0 && seq != last + 1 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: InventoryEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| StockProjectionError::Deserialize(e.to_string()))?;

        let item_id = match &event {
            InventoryEvent::ItemCreated(e) => e.item_id,
            InventoryEvent::StockReserved(e) => e.item_id,
            InventoryEvent::StockReleased(e) => e.item_id,
            InventoryEvent::TotalResized(e) => e.item_id,
            InventoryEvent::ConditionChanged(e) => e.item_id,
            InventoryEvent::DetailsUpdated(e) => e.item_id,
        };

        if item_id.0 != aggregate_id {
            return Err(StockProjectionError::AggregateMismatch);
        }

        match event {
            InventoryEvent::ItemCreated(e) => {
                self.store.upsert(
                    e.item_id,
                    StockLevel {
                        item_id: e.item_id,
                        code: e.code,
                        name: e.details.name,
                        category: e.details.category,
                        location: e.details.location,
                        condition: e.condition,
                        borrowable: e.details.borrowable,
                        quantity_total: e.quantity_total,
                        quantity_available: e.quantity_total,
                        quantity_borrowed: 0,
                    },
                );
            }
            InventoryEvent::StockReserved(e) => {
                if let Some(mut level) = self.store.get(&e.item_id) {
                    level.quantity_available = level.quantity_available.saturating_sub(e.quantity);
                    level.quantity_borrowed += e.quantity;
                    self.store.upsert(e.item_id, level);
                }
            }
            InventoryEvent::StockReleased(e) => {
                if let Some(mut level) = self.store.get(&e.item_id) {
                    level.quantity_available += e.quantity;
                    level.quantity_borrowed = level.quantity_borrowed.saturating_sub(e.quantity);
                    self.store.upsert(e.item_id, level);
                }
            }
            InventoryEvent::TotalResized(e) => {
                if let Some(mut level) = self.store.get(&e.item_id) {
                    level.quantity_total = e.new_total;
                    level.quantity_available = e.new_total.saturating_sub(level.quantity_borrowed);
                    self.store.upsert(e.item_id, level);
                }
            }
            InventoryEvent::ConditionChanged(e) => {
                if let Some(mut level) = self.store.get(&e.item_id) {
                    level.condition = e.condition;
                    self.store.upsert(e.item_id, level);
                }
            }
            InventoryEvent::DetailsUpdated(e) => {
                if let Some(mut level) = self.store.get(&e.item_id) {
                    level.name = e.details.name;
                    level.category = e.details.category;
                    level.location = e.details.location;
                    level.borrowable = e.details.borrowable;
                    self.store.upsert(e.item_id, level);
                }
            }
        }

        // Advance cursor after successful apply.
        cursors.insert(aggregate_id, seq);

        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StockProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        // Deterministic replay order: aggregate, then sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
