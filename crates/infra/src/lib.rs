//! Infrastructure layer: event storage, service orchestration, observers.
//!
//! The domain crates (`stockroom-inventory`, `stockroom-borrowing`) are pure;
//! everything that touches storage, locking, or external collaborators lives
//! here. [`service::BorrowService`] is the single entry point callers use.

pub mod audit;
pub mod event_store;
pub mod notify;
pub mod projections;
pub mod read_model;
pub mod service;

#[cfg(test)]
mod integration_tests;
