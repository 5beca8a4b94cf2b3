//! In-process log journal served by the web API
//!
//! A fixed-capacity ring buffer of structured entries. Entries below the
//! runtime-adjustable minimum level are not stored.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

/// Maximum number of retained entries
pub const JOURNAL_CAPACITY: usize = 1000;

/// Journal severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl JournalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalLevel::Trace => "trace",
            JournalLevel::Debug => "debug",
            JournalLevel::Info => "info",
            JournalLevel::Warning => "warning",
            JournalLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(JournalLevel::Trace),
            "debug" => Some(JournalLevel::Debug),
            "info" => Some(JournalLevel::Info),
            "warning" | "warn" => Some(JournalLevel::Warning),
            "error" => Some(JournalLevel::Error),
            _ => None,
        }
    }
}

/// Fixed component categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Udp,
    Transport,
    Wallbox,
    E3dc,
    Strategy,
    Scheduler,
    Cli,
    Fhem,
    Web,
    Notification,
    System,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Udp => "udp",
            LogCategory::Transport => "transport",
            LogCategory::Wallbox => "wallbox",
            LogCategory::E3dc => "e3dc",
            LogCategory::Strategy => "strategy",
            LogCategory::Scheduler => "scheduler",
            LogCategory::Cli => "cli",
            LogCategory::Fhem => "fhem",
            LogCategory::Web => "web",
            LogCategory::Notification => "notification",
            LogCategory::System => "system",
        }
    }
}

/// A single journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: JournalLevel,
    pub category: LogCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Ring buffer with a runtime minimum level
#[derive(Debug)]
pub struct Journal {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    min_level: JournalLevel,
}

impl Journal {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(JOURNAL_CAPACITY),
            next_id: 1,
            min_level: JournalLevel::Info,
        }
    }

    fn record(
        &mut self,
        level: JournalLevel,
        category: LogCategory,
        message: &str,
        details: Option<serde_json::Value>,
    ) {
        if level < self.min_level {
            return;
        }
        if self.entries.len() >= JOURNAL_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            id: self.next_id,
            timestamp: Utc::now(),
            level,
            category,
            message: message.to_string(),
            details,
        });
        self.next_id += 1;
    }
}

static JOURNAL: Lazy<RwLock<Journal>> = Lazy::new(|| RwLock::new(Journal::new()));

/// Append an entry; silently dropped below the minimum level
pub fn record(
    level: JournalLevel,
    category: LogCategory,
    message: &str,
    details: Option<serde_json::Value>,
) {
    if let Ok(mut journal) = JOURNAL.write() {
        journal.record(level, category, message, details);
    }
}

/// All retained entries, oldest first
pub fn snapshot() -> Vec<LogEntry> {
    JOURNAL
        .read()
        .map(|journal| journal.entries.iter().cloned().collect())
        .unwrap_or_default()
}

/// Drop every retained entry
pub fn clear() {
    if let Ok(mut journal) = JOURNAL.write() {
        journal.entries.clear();
    }
}

/// Set the minimum stored level
pub fn set_min_level(level: JournalLevel) {
    if let Ok(mut journal) = JOURNAL.write() {
        journal.min_level = level;
    }
}

/// Current minimum stored level
pub fn min_level() -> JournalLevel {
    JOURNAL
        .read()
        .map(|journal| journal.min_level)
        .unwrap_or(JournalLevel::Info)
}
