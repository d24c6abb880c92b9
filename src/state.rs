//! Per-session replication progress.

use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub current_lsn: Option<Lsn>,
    pub last_report_at: Option<SystemTime>,
}

/// Progress shared by the receive loop and the heartbeat of one session.
///
/// `current_lsn` only moves forward: a candidate is adopted iff it is
/// greater than the current value or no value has been seen yet.
#[derive(Debug, Default)]
pub struct ReplicationState {
    inner: Mutex<ProgressSnapshot>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    // Critical sections never panic, so a poisoned lock still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply the monotonic-adopt rule and return the resulting position.
    pub fn observe(&self, candidate: Lsn) -> Lsn {
        let mut g = self.lock();
        match g.current_lsn {
            Some(cur) if cur >= candidate => cur,
            _ => {
                g.current_lsn = Some(candidate);
                candidate
            }
        }
    }

    pub fn current_lsn(&self) -> Option<Lsn> {
        self.lock().current_lsn
    }

    pub fn last_report_at(&self) -> Option<SystemTime> {
        self.lock().last_report_at
    }

    pub fn record_report(&self, at: SystemTime) {
        self.lock().last_report_at = Some(at);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.lock()
    }
}
