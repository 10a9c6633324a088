//! Inventory ledger domain module (event-sourced).
//!
//! Single source of truth for per-item stock counters. Every counter change
//! goes through the [`InventoryItem`] aggregate; nothing else is allowed to
//! touch `quantity_available`/`quantity_borrowed`.

pub mod item;

pub use item::{
    ConditionChanged, CreateItem, DetailsUpdated, InventoryCommand, InventoryEvent, InventoryItem,
    ItemCondition, ItemCreated, ItemDetails, ItemId, Release, Reserve, Resize, SetCondition,
    StockReleased, StockReserved, TotalResized, UpdateDetails,
};
