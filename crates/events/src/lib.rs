//! Domain events: the typed `Event` contract, the immutable records a unit of
//! work stages for the outbox, and the bus the outbox dispatcher delivers to.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod record;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use record::{Correlation, DomainEventRecord};
