//! Service runtime data shared between the supervisor and the API

use crate::config::ServiceSpec;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Lifecycle state of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Registered, source not fetched yet
    Uninitialized,
    /// Not running
    Stopped,
    /// Process launched and supervised
    Running,
    /// Deleted; no further operations are accepted
    Removed,
}

/// Captured output of a service, oldest line first.
///
/// Holds at most `capacity` lines; older lines are dropped as new ones
/// arrive. A capacity of zero keeps everything. The buffer also counts every
/// line ever pushed, so readers can resume by position after eviction.
#[derive(Debug)]
pub struct LogBuffer {
    inner: Mutex<LogLines>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct LogLines {
    lines: VecDeque<String>,
    total: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogLines::default()),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.inner.lock();
        if self.capacity > 0 && inner.lines.len() >= self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.into());
        inner.total += 1;
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// Retained lines and the number of lines pushed so far, read together
    pub fn snapshot(&self) -> (Vec<String>, u64) {
        let inner = self.inner.lock();
        (inner.lines.iter().cloned().collect(), inner.total)
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }
}

/// Listing entry for a service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub status: ServiceStatus,
    pub restarts: u32,
}

/// Full view of a service, secrets redacted
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    pub restarts: u32,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub config: ServiceSpec,
    pub logs: Vec<String>,
}
