//! Per-job progress event broadcasting.

mod emitter;

pub use emitter::{EventEmitter, EventRegistry, SseEvent, Subscription};
