//! Per-instance state shared between the registry, its monitor task, and
//! the delivery loop.

use std::collections::VecDeque;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::process::ProcessHandle;

/// Lifecycle of a supervised instance. `Stopped` and `Error` are terminal:
/// an instance in either state can be removed but never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// One aggregated, framed unit of output attributed to a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReply {
    /// ANSI-decorated rendering of the reply.
    pub content: String,
    /// The raw output lines joined with newlines, in receipt order.
    pub raw_content: String,
    pub timestamp: String,
    pub is_complete: bool,
}

impl CompleteReply {
    pub(crate) fn new(raw_content: String, content: String) -> Self {
        Self {
            content,
            raw_content,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            is_complete: true,
        }
    }
}

/// The registry's public, point-in-time view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub status: InstanceStatus,
    pub details: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Unbounded FIFO of complete replies. The monitor task produces; the
/// delivery loop drains destructively, in order. Opportunistic reads of the
/// current length are allowed from anywhere.
#[derive(Default)]
pub struct OutputQueue {
    inner: Mutex<VecDeque<CompleteReply>>,
}

impl OutputQueue {
    pub(crate) async fn push(&self, reply: CompleteReply) {
        self.inner.lock().await.push_back(reply);
    }

    /// Remove and return everything currently queued; never waits for new
    /// records to arrive.
    pub async fn drain(&self) -> Vec<CompleteReply> {
        self.inner.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// One supervised child process plus its bookkeeping state.
pub struct Instance {
    id: String,
    created_at: DateTime<Utc>,
    status: RwLock<InstanceStatus>,
    details: RwLock<String>,
    process: ProcessHandle,
    output: OutputQueue,
    last_activity: RwLock<DateTime<Utc>>,
}

impl Instance {
    pub(crate) fn new(id: String, process: ProcessHandle) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            status: RwLock::new(InstanceStatus::Starting),
            details: RwLock::new("starting".to_string()),
            process,
            output: OutputQueue::default(),
            last_activity: RwLock::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn output(&self) -> &OutputQueue {
        &self.output
    }

    pub(crate) fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub async fn status(&self) -> InstanceStatus {
        *self.status.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == InstanceStatus::Running
    }

    pub(crate) async fn set_status(&self, status: InstanceStatus, details: impl Into<String>) {
        *self.status.write().await = status;
        *self.details.write().await = details.into();
    }

    pub(crate) async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            status: self.status().await,
            details: self.details.read().await.clone(),
            pid: self.process.pid(),
            created_at: self.created_at,
            last_activity: *self.last_activity.read().await,
        }
    }
}
