//! In-process event bus for cycle events

pub mod bus;
pub mod types;

pub use bus::{BusStats, EventBus, EventHandler, EventStream};
pub use types::{CycleEvent, EventPayload, ProducerFailedEvent, Topic};
