// crates/flowcore/src/events/mod.rs

mod bus;
mod event;
mod query;

pub use bus::EventBus;
pub use event::{EventSink, EventType, ExecutionEvent, ProgressEvent};
pub use query::{EventOrder, EventQuery};
