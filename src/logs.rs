//! The most recent log events, kept in memory for `GET /api/logs`.

use std::{
    collections::VecDeque,
    fmt::{self, Write},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{layer::Context, Layer};

/// How many events [LogBuffer::default] keeps.
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    pub level: String,
    pub timestamp: DateTime<Utc>,
    /// the formatted message followed by its structured fields
    pub message: String,
}

/// Ring of the last `capacity` log events. Clones share the ring.
#[derive(Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogMessage>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append `msg`, evicting the oldest entry when full.
    pub fn push(&self, msg: LogMessage) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(msg);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<LogMessage> {
        self.entries.lock().iter().cloned().collect()
    }

    /// A [Layer] recording every event that passes the subscriber's filter into this buffer.
    pub fn layer(&self) -> LogLayer {
        LogLayer { buffer: self.clone() }
    }
}

pub struct LogLayer {
    buffer: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut text = MessageText::default();
        event.record(&mut text);
        self.buffer.push(LogMessage {
            level: event.metadata().level().to_string(),
            timestamp: Utc::now(),
            message: text.finish(),
        });
    }
}

#[derive(Default)]
struct MessageText {
    message: String,
    fields: String,
}

impl MessageText {
    fn finish(mut self) -> String {
        if self.message.is_empty() {
            return self.fields.trim_start().to_string();
        }
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for MessageText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
