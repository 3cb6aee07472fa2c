//! Bounded in-memory record of recent chat calls, for the admin API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Entries kept before the oldest is evicted.
pub const CALL_LOG_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Success,
    Failed,
}

/// One inbound chat request.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub stream: bool,
    pub status: CallStatus,
    /// Suffix of the key that served the request.
    pub key_used: Option<String>,
    pub error_info: Option<String>,
}

impl CallRecord {
    /// A pending record for a request that just arrived.
    pub fn start(model: impl Into<String>, stream: bool) -> Self {
        Self {
            id: format!("log-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            model: model.into(),
            stream,
            status: CallStatus::Pending,
            key_used: None,
            error_info: None,
        }
    }

    pub fn succeeded(mut self, key_suffix: String) -> Self {
        self.status = CallStatus::Success;
        self.key_used = Some(key_suffix);
        self
    }

    pub fn failed(mut self, key_suffix: Option<String>, error: impl Into<String>) -> Self {
        self.status = CallStatus::Failed;
        self.key_used = key_suffix;
        self.error_info = Some(error.into());
        self
    }
}

/// Fixed-capacity log, newest first.
#[derive(Debug)]
pub struct CallLog {
    entries: Mutex<VecDeque<CallRecord>>,
    capacity: usize,
}

impl Default for CallLog {
    fn default() -> Self {
        Self::with_capacity(CALL_LOG_CAPACITY)
    }
}

impl CallLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, record: CallRecord) {
        tracing::debug!(
            id = %record.id,
            status = ?record.status,
            key = record.key_used.as_deref().unwrap_or("-"),
            "Recorded call"
        );
        let mut entries = self.lock();
        entries.push_front(record);
        entries.truncate(self.capacity);
    }

    /// Snapshot of the log, newest first.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CallRecord>> {
        // A panic while holding the lock cannot leave the deque half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
