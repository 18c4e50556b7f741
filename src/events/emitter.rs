//! SSE event emitter with ring buffer for reconnection.
//!
//! Each job owns an [`EventEmitter`]: an ordered broadcast channel that keeps
//! the most recent events in a fixed-capacity ring buffer so a client that
//! reconnects with `Last-Event-ID` can be caught up before joining the live
//! fan-out. Delivery is non-blocking; a slow or vanished subscriber never
//! stalls the pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// One server-sent event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// Monotonic per-emitter id, starting at 1.
    pub id: u64,
    /// Event name, e.g. `page.completed`.
    pub event: String,
    /// JSON payload.
    pub data: serde_json::Value,
}

impl SseEvent {
    /// Encode in SSE wire format.
    pub fn encode(&self) -> String {
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.event, self.data)
    }
}

struct EmitterState {
    counter: u64,
    buffer: VecDeque<SseEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SseEvent>>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Per-job event emitter with a ring buffer and subscriber fan-out.
///
/// End-of-stream is signalled by dropping a subscriber's sender: its receiver
/// drains any queued events and then yields `None`.
pub struct EventEmitter {
    buffer_size: usize,
    state: Mutex<EmitterState>,
}

impl EventEmitter {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: Mutex::new(EmitterState {
                counter: 0,
                buffer: VecDeque::with_capacity(buffer_size),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                closed: false,
            }),
        }
    }

    /// Emit an event to all subscribers and store it in the ring buffer.
    ///
    /// Returns the stored event, or `None` when the emitter is already closed
    /// (emission after close is silently rejected).
    pub fn emit(&self, event: &str, data: serde_json::Value) -> Option<SseEvent> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }

        state.counter += 1;
        let sse_event = SseEvent {
            id: state.counter,
            event: event.to_string(),
            data,
        };

        if state.buffer.len() == self.buffer_size {
            state.buffer.pop_front();
        }
        state.buffer.push_back(sse_event.clone());

        // Prune subscribers whose receiver side is gone.
        state
            .subscribers
            .retain(|_, tx| tx.send(sse_event.clone()).is_ok());

        Some(sse_event)
    }

    /// Create a new subscription.
    ///
    /// If `last_event_id` is provided, still-buffered events with a strictly
    /// greater id are queued first, in order. On a closed emitter the
    /// subscription yields any replayed events and then ends.
    pub fn subscribe(self: &Arc<Self>, last_event_id: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();

        if let Some(last_id) = last_event_id {
            for event in state.buffer.iter().filter(|e| e.id > last_id) {
                let _ = tx.send(event.clone());
            }
        }

        let id = if state.closed {
            // Dropping the sender here ends the stream after the replay.
            None
        } else {
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.insert(id, tx);
            Some(id)
        };

        Subscription {
            emitter: Arc::clone(self),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().unwrap().subscribers.remove(&id);
    }

    /// Signal all subscribers that no more events are coming. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// All events currently in the ring buffer, in order.
    pub fn snapshot(&self) -> Vec<SseEvent> {
        self.state.lock().unwrap().buffer.iter().cloned().collect()
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }
}

/// A live subscription to an [`EventEmitter`]. Unsubscribes on drop.
pub struct Subscription {
    emitter: Arc<EventEmitter>,
    id: Option<u64>,
    rx: mpsc::UnboundedReceiver<SseEvent>,
}

impl Subscription {
    /// Receive the next event; `None` marks end-of-stream.
    pub async fn recv(&mut self) -> Option<SseEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining already-queued events.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<SseEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.emitter.unsubscribe(id);
        }
    }
}

/// Process-wide registry of per-job event emitters.
#[derive(Default)]
pub struct EventRegistry {
    emitters: Mutex<HashMap<String, Arc<EventEmitter>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the emitter for a job, creating it on first use. Idempotent.
    pub fn get_or_create(&self, job_id: &str, buffer_size: usize) -> Arc<EventEmitter> {
        let mut emitters = self.emitters.lock().unwrap();
        Arc::clone(
            emitters
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(EventEmitter::new(buffer_size))),
        )
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<EventEmitter>> {
        self.emitters.lock().unwrap().get(job_id).cloned()
    }

    /// Drop a job's emitter, closing it first.
    pub fn remove(&self, job_id: &str) {
        let emitter = self.emitters.lock().unwrap().remove(job_id);
        if let Some(emitter) = emitter {
            emitter.close();
        }
    }
}
