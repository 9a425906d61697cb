//! Event Bus
//!
//! Wraps domain events in a versioned envelope, bounds their size, derives
//! the channels they belong to and publishes them best-effort. Delivery to
//! live sockets happens in [`crate::hub`].

mod bus;
mod channel;
mod envelope;
mod error;
mod transport;

pub use bus::EventBus;
pub use channel::Channel;
pub use envelope::{
    DomainEvent, EventEnvelope, Severity, DEFAULT_SIZE_CAP, ENVELOPE_VERSION, RETAINED_FIELDS,
};
pub use error::{EventBusError, InvalidChannel};
pub use transport::{
    bus_channel, bus_pattern, parse_bus_channel, BusMessage, EventTransport, LocalTransport,
    RedisTransport,
};
