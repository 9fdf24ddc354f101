//! Event bus utilities: structured pipeline events, fan-out, and sinks.
//!
//! Components emit [`Event`]s over a cheap flume sender; the [`EventBus`]
//! drains them on a background task and broadcasts to every registered
//! [`EventSink`]. Producers never block on sink I/O.

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use event::{AttemptEvent, BreakerEvent, DiagnosticEvent, Event, JobEvent};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
