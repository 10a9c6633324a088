//! `stockroom-events` — event mechanics shared by the domain modules.
//!
//! Events are facts: immutable, versioned, append-only. This crate holds the
//! transport-agnostic pieces (event contract, envelope, pub/sub bus); storage
//! lives in `stockroom-infra`.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
