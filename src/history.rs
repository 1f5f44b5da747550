//! In-memory chat history and system log stores.
//!
//! Per-process only: restarting the server loses both stores. Each store is
//! a bounded ring so a long-lived server cannot grow without limit.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Consumed by the subscription bridge. Implementations must be cheap and
/// must never fail the delivery path.
pub trait HistorySink: Send + Sync {
    fn record_message(&self, sender: &str, message: &str, instance_id: &str);
    fn record_system_event(&self, text: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemLogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct ChatHistory {
    limit: usize,
    messages: RwLock<VecDeque<ChatMessage>>,
    system_logs: RwLock<VecDeque<SystemLogEntry>>,
}

impl ChatHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            messages: RwLock::new(VecDeque::new()),
            system_logs: RwLock::new(VecDeque::new()),
        }
    }

    pub fn record_message(&self, sender: &str, message: &str, instance_id: &str) {
        let mut messages = self.messages.write();
        if messages.len() == self.limit {
            messages.pop_front();
        }
        messages.push_back(ChatMessage {
            sender: sender.to_string(),
            message: message.to_string(),
            instance_id: instance_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn record_system_event(&self, text: &str) {
        let mut logs = self.system_logs.write();
        if logs.len() == self.limit {
            logs.pop_front();
        }
        logs.push_back(SystemLogEntry {
            message: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Newest `limit` chat messages in chronological order; everything when
    /// no limit is given.
    pub fn chat_history(&self, limit: Option<usize>) -> Vec<ChatMessage> {
        let messages = self.messages.read();
        tail(&messages, limit)
    }

    pub fn system_logs(&self, limit: Option<usize>) -> Vec<SystemLogEntry> {
        let logs = self.system_logs.read();
        tail(&logs, limit)
    }

    pub fn clear_chat_history(&self) {
        self.messages.write().clear();
    }

    pub fn clear_system_logs(&self) {
        self.system_logs.write().clear();
    }
}

impl HistorySink for ChatHistory {
    fn record_message(&self, sender: &str, message: &str, instance_id: &str) {
        ChatHistory::record_message(self, sender, message, instance_id);
    }

    fn record_system_event(&self, text: &str) {
        ChatHistory::record_system_event(self, text);
    }
}

fn tail<T: Clone>(entries: &VecDeque<T>, limit: Option<usize>) -> Vec<T> {
    let take = limit.unwrap_or(entries.len()).min(entries.len());
    entries.iter().skip(entries.len() - take).cloned().collect()
}
