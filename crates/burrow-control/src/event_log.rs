//! Bounded per-entity event history
//!
//! Agents and tunnels keep a short history of notable events for the
//! dashboard. Each entity gets a ring buffer of at most `capacity` entries;
//! the oldest entry is dropped when a new one arrives.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, entity_id: &str, level: LogLevel, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ring = entries
            .entry(entity_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(16)));

        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, entity_id: &str, message: impl Into<String>) {
        self.record(entity_id, LogLevel::Info, message);
    }

    pub fn warn(&self, entity_id: &str, message: impl Into<String>) {
        self.record(entity_id, LogLevel::Warn, message);
    }

    pub fn error(&self, entity_id: &str, message: impl Into<String>) {
        self.record(entity_id, LogLevel::Error, message);
    }

    /// Newest first, at most `limit` entries
    pub fn recent(&self, entity_id: &str, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(entity_id)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, entity_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(entity_id);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_newest_first() {
        let log = EventLog::new(10);
        log.info("agent-1", "connected");
        log.warn("agent-1", "slow heartbeat");
        log.info("agent-1", "disconnected");

        let recent = log.recent("agent-1", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "disconnected");
        assert_eq!(recent[1].message, "slow heartbeat");
        assert_eq!(recent[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_ring_drops_oldest() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.info("tun-1", format!("event {}", i));
        }

        let recent = log.recent("tun-1", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "event 4");
        assert_eq!(recent[2].message, "event 2");
    }

    #[test]
    fn test_entities_are_separate() {
        let log = EventLog::new(5);
        log.info("a", "one");
        log.info("b", "two");
        log.forget("a");

        assert!(log.recent("a", 5).is_empty());
        assert_eq!(log.recent("b", 5).len(), 1);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let log = EventLog::new(0);
        log.info("a", "one");
        assert!(log.recent("a", 5).is_empty());
    }
}
