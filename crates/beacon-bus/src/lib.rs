pub mod backoff;
pub mod bus;
pub mod memory;
pub mod nats;

pub use backoff::ExponentialBackoff;
pub use bus::{BusError, BusStream, MessageBus};
pub use memory::InMemoryBus;
pub use nats::NatsBus;
