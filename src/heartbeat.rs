//! Periodic standby status updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Instrument, debug, error, trace, warn};

use crate::connection::FrameWriter;
use crate::error::ReplicationError;
use crate::session::{StatusReport, WritePath};
use crate::state::ReplicationState;

/// What a single heartbeat tick did.
#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    Sent(StatusReport),
    /// No position observed yet; nothing was written.
    Skipped,
    /// The send did not finish within the per-tick budget. A frame that
    /// already started is still written out in full.
    TimedOut(Duration),
    Failed(ReplicationError),
}

/// Sends a status update for the session's current position every
/// `period`, starting one period after [`spawn`](Self::spawn).
///
/// Outcomes are only logged (and forwarded to the observer, if any): a
/// failing heartbeat never ends the session.
pub struct HeartbeatScheduler<W> {
    writer: WritePath<W>,
    state: Arc<ReplicationState>,
    period: Duration,
    timeout: Duration,
    observer: Option<mpsc::Sender<HeartbeatOutcome>>,
}

impl<W: FrameWriter> HeartbeatScheduler<W> {
    pub fn new(
        writer: WritePath<W>,
        state: Arc<ReplicationState>,
        period: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            writer,
            state,
            period,
            timeout,
            observer: None,
        }
    }

    /// Forward every outcome to `tx`. Outcomes are dropped when the channel
    /// is full.
    pub fn with_observer(mut self, tx: mpsc::Sender<HeartbeatOutcome>) -> Self {
        self.observer = Some(tx);
        self
    }

    /// Run one tick now.
    pub async fn tick(&self) -> HeartbeatOutcome {
        if self.state.current_lsn().is_none() {
            return HeartbeatOutcome::Skipped;
        }
        match tokio::time::timeout(self.timeout, self.writer.send_status_update(&self.state)).await
        {
            Ok(Ok(Some(report))) => HeartbeatOutcome::Sent(report),
            Ok(Ok(None)) => HeartbeatOutcome::Skipped,
            Ok(Err(e)) => HeartbeatOutcome::Failed(e),
            Err(_) => HeartbeatOutcome::TimedOut(self.timeout),
        }
    }

    /// Start the timer on its own task, in the caller's span.
    pub fn spawn(self) -> HeartbeatHandle {
        let task = tokio::spawn(self.run().in_current_span());
        HeartbeatHandle { task }
    }

    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let outcome = self.tick().await;
            self.log_outcome(&outcome);
            if let Some(tx) = &self.observer {
                let _ = tx.try_send(outcome);
            }
        }
    }

    fn log_outcome(&self, outcome: &HeartbeatOutcome) {
        match outcome {
            HeartbeatOutcome::Sent(report) => {
                let snap = self.state.snapshot();
                debug!(
                    lsn = %report.lsn,
                    current_lsn = ?snap.current_lsn,
                    last_report_at = ?snap.last_report_at,
                    "status update sent"
                );
            }
            HeartbeatOutcome::Skipped => trace!("no position yet; status update skipped"),
            HeartbeatOutcome::TimedOut(after) => {
                warn!(?after, "status update timed out");
            }
            HeartbeatOutcome::Failed(e) => error!(error = %e, "status update failed"),
        }
    }
}

/// Owner of a running heartbeat task. Dropping it stops the timer.
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
