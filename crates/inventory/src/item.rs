use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use stockroom_events::Event;

/// Inventory item identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub AggregateId);

impl ItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Physical condition of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCondition {
    Excellent,
    Good,
    Fair,
    Poor,
    Damaged,
}

impl ItemCondition {
    /// Conditions that trigger a condition update on the item when a
    /// borrowed unit comes back in this state.
    pub fn is_degraded(self) -> bool {
        matches!(self, ItemCondition::Poor | ItemCondition::Damaged)
    }
}

impl core::fmt::Display for ItemCondition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ItemCondition::Excellent => "excellent",
            ItemCondition::Good => "good",
            ItemCondition::Fair => "fair",
            ItemCondition::Poor => "poor",
            ItemCondition::Damaged => "damaged",
        };
        f.write_str(s)
    }
}

/// Descriptive (non-counter) item attributes, editable by staff after
/// creation. The item code is deliberately absent: it is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub name: String,
    pub category: String,
    pub description: String,
    pub location: String,
    pub borrowable: bool,
}

/// Aggregate root: InventoryItem.
///
/// Counter invariant, holding after every applied event:
/// `quantity_available + quantity_borrowed == quantity_total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    id: ItemId,
    code: String,
    details: ItemDetails,
    condition: ItemCondition,
    quantity_total: u32,
    quantity_available: u32,
    quantity_borrowed: u32,
    version: u64,
    created: bool,
}

impl InventoryItem {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ItemId) -> Self {
        Self {
            id,
            code: String::new(),
            details: ItemDetails {
                name: String::new(),
                category: String::new(),
                description: String::new(),
                location: String::new(),
                borrowable: false,
            },
            condition: ItemCondition::Good,
            quantity_total: 0,
            quantity_available: 0,
            quantity_borrowed: 0,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ItemId {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn details(&self) -> &ItemDetails {
        &self.details
    }

    pub fn condition(&self) -> ItemCondition {
        self.condition
    }

    pub fn is_borrowable(&self) -> bool {
        self.details.borrowable
    }

    pub fn quantity_total(&self) -> u32 {
        self.quantity_total
    }

    pub fn quantity_available(&self) -> u32 {
        self.quantity_available
    }

    pub fn quantity_borrowed(&self) -> u32 {
        self.quantity_borrowed
    }

    pub fn exists(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for InventoryItem {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateItem (staff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateItem {
    pub item_id: ItemId,
    pub code: String,
    pub details: ItemDetails,
    pub condition: ItemCondition,
    pub quantity_total: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Reserve — move stock from available to borrowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserve {
    pub item_id: ItemId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Release — inverse of [`Reserve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub item_id: ItemId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Resize — staff edit of the total quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub item_id: ItemId,
    pub new_total: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetCondition — record condition after a degraded return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCondition {
    pub item_id: ItemId,
    pub condition: ItemCondition,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateDetails — staff edit of descriptive attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetails {
    pub item_id: ItemId,
    pub details: ItemDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    CreateItem(CreateItem),
    Reserve(Reserve),
    Release(Release),
    Resize(Resize),
    SetCondition(SetCondition),
    UpdateDetails(UpdateDetails),
}

/// Event: ItemCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCreated {
    pub item_id: ItemId,
    pub code: String,
    pub details: ItemDetails,
    pub condition: ItemCondition,
    pub quantity_total: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub item_id: ItemId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased.
///
/// `quantity` is the released amount after clamping to the outstanding
/// borrowed count; it never exceeds `quantity_borrowed` at decision time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub item_id: ItemId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TotalResized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalResized {
    pub item_id: ItemId,
    pub new_total: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConditionChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionChanged {
    pub item_id: ItemId,
    pub condition: ItemCondition,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DetailsUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsUpdated {
    pub item_id: ItemId,
    pub details: ItemDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    ItemCreated(ItemCreated),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    TotalResized(TotalResized),
    ConditionChanged(ConditionChanged),
    DetailsUpdated(DetailsUpdated),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::ItemCreated(_) => "inventory.item.created",
            InventoryEvent::StockReserved(_) => "inventory.item.stock_reserved",
            InventoryEvent::StockReleased(_) => "inventory.item.stock_released",
            InventoryEvent::TotalResized(_) => "inventory.item.total_resized",
            InventoryEvent::ConditionChanged(_) => "inventory.item.condition_changed",
            InventoryEvent::DetailsUpdated(_) => "inventory.item.details_updated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::ItemCreated(e) => e.occurred_at,
            InventoryEvent::StockReserved(e) => e.occurred_at,
            InventoryEvent::StockReleased(e) => e.occurred_at,
            InventoryEvent::TotalResized(e) => e.occurred_at,
            InventoryEvent::ConditionChanged(e) => e.occurred_at,
            InventoryEvent::DetailsUpdated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryItem {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::ItemCreated(e) => {
                self.id = e.item_id;
                self.code = e.code.clone();
                self.details = e.details.clone();
                self.condition = e.condition;
                self.quantity_total = e.quantity_total;
                self.quantity_available = e.quantity_total;
                self.quantity_borrowed = 0;
                self.created = true;
            }
            InventoryEvent::StockReserved(e) => {
                self.quantity_available = self.quantity_available.saturating_sub(e.quantity);
                self.quantity_borrowed += e.quantity;
            }
            InventoryEvent::StockReleased(e) => {
                self.quantity_available += e.quantity;
                self.quantity_borrowed = self.quantity_borrowed.saturating_sub(e.quantity);
            }
            InventoryEvent::TotalResized(e) => {
                self.quantity_total = e.new_total;
                self.quantity_available = e.new_total.saturating_sub(self.quantity_borrowed);
            }
            InventoryEvent::ConditionChanged(e) => {
                self.condition = e.condition;
            }
            InventoryEvent::DetailsUpdated(e) => {
                self.details = e.details.clone();
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;

        // Counters must reconcile after every applied event.
        debug_assert!(
            !self.created
                || self.quantity_available + self.quantity_borrowed == self.quantity_total
        );
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::CreateItem(cmd) => self.handle_create(cmd),
            InventoryCommand::Reserve(cmd) => self.handle_reserve(cmd),
            InventoryCommand::Release(cmd) => self.handle_release(cmd),
            InventoryCommand::Resize(cmd) => self.handle_resize(cmd),
            InventoryCommand::SetCondition(cmd) => self.handle_set_condition(cmd),
            InventoryCommand::UpdateDetails(cmd) => self.handle_update_details(cmd),
        }
    }
}

impl InventoryItem {
    fn ensure_item_id(&self, item_id: ItemId) -> Result<(), DomainError> {
        if self.id != item_id {
            return Err(DomainError::validation("item_id mismatch"));
        }
        Ok(())
    }

    fn ensure_exists(&self, item_id: ItemId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(item_id)
    }

    fn handle_create(&self, cmd: &CreateItem) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::validation("item already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("item code cannot be empty"));
        }
        if cmd.details.name.trim().is_empty() {
            return Err(DomainError::validation("item name cannot be empty"));
        }

        Ok(vec![InventoryEvent::ItemCreated(ItemCreated {
            item_id: cmd.item_id,
            code: cmd.code.clone(),
            details: cmd.details.clone(),
            condition: cmd.condition,
            quantity_total: cmd.quantity_total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &Reserve) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_exists(cmd.item_id)?;

        if cmd.quantity == 0 {
            return Err(DomainError::invalid_quantity(
                "reserve quantity must be at least 1",
            ));
        }
        if self.quantity_available < cmd.quantity {
            return Err(DomainError::insufficient_stock(
                cmd.quantity,
                self.quantity_available,
            ));
        }

        Ok(vec![InventoryEvent::StockReserved(StockReserved {
            item_id: cmd.item_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &Release) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_exists(cmd.item_id)?;

        if cmd.quantity == 0 {
            return Err(DomainError::invalid_quantity(
                "release quantity must be at least 1",
            ));
        }

        // Clamp to the outstanding borrowed count so no counter can go
        // negative; the event records the amount actually released.
        let released = cmd.quantity.min(self.quantity_borrowed);

        Ok(vec![InventoryEvent::StockReleased(StockReleased {
            item_id: cmd.item_id,
            quantity: released,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_resize(&self, cmd: &Resize) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_exists(cmd.item_id)?;

        if cmd.new_total < self.quantity_borrowed {
            return Err(DomainError::invalid_quantity(format!(
                "new total {} is below the {} units currently out on loan",
                cmd.new_total, self.quantity_borrowed
            )));
        }

        Ok(vec![InventoryEvent::TotalResized(TotalResized {
            item_id: cmd.item_id,
            new_total: cmd.new_total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_condition(&self, cmd: &SetCondition) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_exists(cmd.item_id)?;

        Ok(vec![InventoryEvent::ConditionChanged(ConditionChanged {
            item_id: cmd.item_id,
            condition: cmd.condition,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_details(&self, cmd: &UpdateDetails) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_exists(cmd.item_id)?;

        if cmd.details.name.trim().is_empty() {
            return Err(DomainError::validation("item name cannot be empty"));
        }

        Ok(vec![InventoryEvent::DetailsUpdated(DetailsUpdated {
            item_id: cmd.item_id,
            details: cmd.details.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
