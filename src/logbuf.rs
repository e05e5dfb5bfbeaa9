//! Process-wide log ring buffer (spec §7, §9): a singleton owned by the
//! process entry point, fed by a `tracing_subscriber::Layer`, exposed to the
//! HTTP surface's `/logs` endpoints as thread-safe, snapshot-returning reads.
#![allow(dead_code)]
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

struct RingBuffer {
    all: VecDeque<LogRecord>,
    all_capacity: usize,
    alerts: VecDeque<LogRecord>,
    alerts_capacity: usize,
}

impl RingBuffer {
    fn new(all_capacity: usize, alerts_capacity: usize) -> Self {
        Self {
            all: VecDeque::with_capacity(all_capacity.min(1024)),
            all_capacity,
            alerts: VecDeque::with_capacity(alerts_capacity.min(1024)),
            alerts_capacity,
        }
    }

    fn push(&mut self, record: LogRecord) {
        let is_alert = matches!(record.level.as_str(), "WARN" | "ERROR");
        if self.all.len() >= self.all_capacity {
            self.all.pop_front();
        }
        self.all.push_back(record.clone());

        if is_alert {
            if self.alerts.len() >= self.alerts_capacity {
                self.alerts.pop_front();
            }
            self.alerts.push_back(record);
        }
    }
}

static BUFFER: OnceCell<Mutex<RingBuffer>> = OnceCell::new();

pub fn init(all_capacity: usize, alerts_capacity: usize) {
    let _ = BUFFER.set(Mutex::new(RingBuffer::new(all_capacity, alerts_capacity)));
}

fn buffer() -> &'static Mutex<RingBuffer> {
    BUFFER.get_or_init(|| Mutex::new(RingBuffer::new(10_000, 2_000)))
}

/// Options for `/logs` (spec §6).
#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub level: Option<String>,
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

fn filter(records: &VecDeque<LogRecord>, query: &LogQuery) -> Vec<LogRecord> {
    let mut out: Vec<LogRecord> = records
        .iter()
        .filter(|r| {
            query
                .level
                .as_ref()
                .map(|l| r.level.eq_ignore_ascii_case(l))
                .unwrap_or(true)
        })
        .filter(|r| query.since.map(|s| r.timestamp >= s).unwrap_or(true))
        .cloned()
        .collect();

    if let Some(limit) = query.limit {
        let start = out.len().saturating_sub(limit);
        out = out.split_off(start);
    }
    out
}

pub fn snapshot(query: LogQuery) -> Vec<LogRecord> {
    let buf = buffer().lock().expect("log buffer poisoned");
    filter(&buf.all, &query)
}

pub fn alerts(query: LogQuery) -> Vec<LogRecord> {
    let buf = buffer().lock().expect("log buffer poisoned");
    filter(&buf.alerts, &query)
}

pub fn clear() {
    let mut buf = buffer().lock().expect("log buffer poisoned");
    buf.all.clear();
}

pub fn clear_alerts() {
    let mut buf = buffer().lock().expect("log buffer poisoned");
    buf.alerts.clear();
}

#[derive(Debug, Serialize)]
pub struct BufferStats {
    pub all_len: usize,
    pub all_capacity: usize,
    pub alerts_len: usize,
    pub alerts_capacity: usize,
}

pub fn stats() -> BufferStats {
    let buf = buffer().lock().expect("log buffer poisoned");
    BufferStats {
        all_len: buf.all.len(),
        all_capacity: buf.all_capacity,
        alerts_len: buf.alerts.len(),
        alerts_capacity: buf.alerts_capacity,
    }
}

/// `tracing_subscriber::Layer` that appends every event into the ring buffer.
pub struct LogBufferLayer;

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };

        let record = LogRecord {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        };

        buffer()
            .lock()
            .expect("log buffer poisoned")
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(level: &str, msg: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: "test".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest_beyond_capacity() {
        let mut buf = RingBuffer::new(2, 2);
        buf.push(rec("INFO", "a"));
        buf.push(rec("INFO", "b"));
        buf.push(rec("INFO", "c"));
        assert_eq!(buf.all.len(), 2);
        assert_eq!(buf.all.front().unwrap().message, "b");
    }

    #[test]
    fn warn_and_error_also_land_in_alerts() {
        let mut buf = RingBuffer::new(10, 10);
        buf.push(rec("INFO", "fine"));
        buf.push(rec("WARN", "careful"));
        buf.push(rec("ERROR", "bad"));
        assert_eq!(buf.all.len(), 3);
        assert_eq!(buf.alerts.len(), 2);
    }

    #[test]
    fn filter_respects_limit() {
        let records: VecDeque<LogRecord> = (0..5).map(|i| rec("INFO", &i.to_string())).collect();
        let out = filter(
            &records,
            &LogQuery {
                level: None,
                limit: Some(2),
                since: None,
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "3");
        assert_eq!(out[1].message, "4");
    }
}
