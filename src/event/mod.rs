//! The Event Sink component (§4.1): typed event records, durable and
//! fire-and-forget emission, client-transport fan-out.

pub mod sink;
pub mod types;

pub use sink::EventSink;
pub use types::{kind, CorrelationIds, Event};
