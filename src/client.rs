//! Public entry point: a supervised, self-reconnecting replication stream.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::ClientConfig;
use crate::connection::{Connector, PgConnector, ReplicationConnection};
use crate::error::ReplicationError;
use crate::heartbeat::{HeartbeatHandle, HeartbeatScheduler};
use crate::lsn::Lsn;
use crate::receiver::{ChangeHandler, run_receive_loop};
use crate::session::{Session, SessionManager, WritePath};
use crate::state::ReplicationState;

/// Pieces of the live session that outlive a single call into the
/// supervisor.
struct LiveSession<T: ReplicationConnection> {
    writer: WritePath<T::Writer>,
    state: Arc<ReplicationState>,
    heartbeat: HeartbeatHandle,
}

struct Slot<T: ReplicationConnection> {
    live: Option<LiveSession<T>>,
    /// Set by `shutdown`; no session is installed afterwards.
    closing: bool,
}

struct Shared<T: ReplicationConnection> {
    slot: Mutex<Slot<T>>,
}

impl<T: ReplicationConnection> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish `live` unless the client is closing, in which case it is
    /// handed back.
    fn install(&self, live: LiveSession<T>) -> std::result::Result<(), LiveSession<T>> {
        let mut slot = self.lock();
        if slot.closing {
            return Err(live);
        }
        slot.live = Some(live);
        Ok(())
    }

    fn take(&self) -> Option<LiveSession<T>> {
        self.lock().live.take()
    }
}

/// A logical replication stream that keeps itself alive.
///
/// [`start`](Self::start) spawns a supervisor task which connects, makes
/// sure the slot exists, starts streaming, sends heartbeats and feeds every
/// change to the handler. When a session ends for any non-fatal reason, the
/// supervisor waits the retry delay and starts over with fresh progress.
///
/// Dropping the client detaches the supervisor; call
/// [`shutdown`](Self::shutdown) to stop it.
pub struct ReplicationClient<C: Connector> {
    shared: Arc<Shared<C::Connection>>,
    supervisor: JoinHandle<ReplicationError>,
    outcome: Option<ReplicationError>,
    status_timeout: Duration,
}

impl ReplicationClient<PgConnector> {
    /// [`start`](Self::start) with the built-in PostgreSQL connector.
    pub fn connect_default<H: ChangeHandler>(config: ClientConfig, handler: H) -> Self {
        Self::start(config, PgConnector, handler)
    }
}

impl<C: Connector> ReplicationClient<C> {
    /// Spawn the supervisor and return immediately. Must be called from
    /// within a tokio runtime.
    pub fn start<H: ChangeHandler>(config: ClientConfig, connector: C, handler: H) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                live: None,
                closing: false,
            }),
        });
        let status_timeout = config.status_timeout;
        let span = info_span!("replication", slot = %config.slot);
        info!(parent: &span, config = %config.describe(), "starting replication client");

        let manager = SessionManager::new(config, connector);
        let supervisor =
            tokio::spawn(supervise(manager, handler, Arc::clone(&shared)).instrument(span));

        Self {
            shared,
            supervisor,
            outcome: None,
            status_timeout,
        }
    }

    /// Position observed by the current session, if one is streaming.
    pub fn progress(&self) -> Option<Lsn> {
        self.shared.lock().live.as_ref()?.state.current_lsn()
    }

    /// `true` while a session is streaming.
    pub fn is_streaming(&self) -> bool {
        self.shared.lock().live.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait for the supervisor to give up and return why. Only fatal errors
    /// end it. Cancel safe; once finished, every call returns the same error.
    pub async fn wait(&mut self) -> ReplicationError {
        if let Some(e) = &self.outcome {
            return e.clone();
        }
        let e = match (&mut self.supervisor).await {
            Ok(e) => e,
            Err(e) if e.is_cancelled() => ReplicationError::Task("supervisor cancelled".into()),
            Err(e) => ReplicationError::Task(format!("supervisor panicked: {e}")),
        };
        self.outcome = Some(e.clone());
        e
    }

    /// Stop streaming.
    ///
    /// The supervisor is cancelled first, so no new session can start. If a
    /// session is open, CopyDone is sent and flushed and the write half is
    /// shut down within `status_timeout`; failures are only logged. The
    /// session's heartbeat is stopped last.
    pub async fn shutdown(&self) {
        let live = {
            let mut slot = self.shared.lock();
            slot.closing = true;
            slot.live.take()
        };
        self.supervisor.abort();

        if let Some(live) = live {
            let end = async {
                live.writer.finish().await?;
                live.writer.close().await?;
                Ok::<_, ReplicationError>(())
            };
            match tokio::time::timeout(self.status_timeout, end).await {
                Ok(Ok(())) => info!(lsn = ?live.state.current_lsn(), "sent CopyDone"),
                Ok(Err(e)) => warn!(error = %e, "could not send CopyDone"),
                Err(_) => warn!(after = ?self.status_timeout, "CopyDone timed out"),
            }
            live.heartbeat.stop();
        }
        // `closing` blocks new installs; leave the slot empty regardless.
        drop(self.shared.take());
    }
}

async fn supervise<C, H>(
    manager: SessionManager<C>,
    mut handler: H,
    shared: Arc<Shared<C::Connection>>,
) -> ReplicationError
where
    C: Connector,
    H: ChangeHandler,
{
    let mut backoff = manager.config().retry.backoff();

    loop {
        let (err, streamed) = match manager.establish().await {
            Ok(session) => (run_session(&manager, session, &mut handler, &shared).await, true),
            Err(e) => (e, false),
        };

        if err.is_fatal() {
            error!(error = %err, "replication stopped");
            return err;
        }
        if streamed {
            backoff.reset();
        }
        let Some(delay) = backoff.next_delay() else {
            let err = ReplicationError::RetryExhausted {
                attempts: backoff.failures(),
                last: Box::new(err),
            };
            error!(error = %err, "replication stopped");
            return err;
        };
        warn!(error = %err, ?delay, "session ended; restarting");
        tokio::time::sleep(delay).await;
    }
}

async fn run_session<C, H>(
    manager: &SessionManager<C>,
    session: Session<C::Connection>,
    handler: &mut H,
    shared: &Shared<C::Connection>,
) -> ReplicationError
where
    C: Connector,
    H: ChangeHandler,
{
    let cfg = manager.config();
    let Session {
        mut reader,
        writer,
        state,
        ..
    } = session;

    let heartbeat = HeartbeatScheduler::new(
        writer.clone(),
        Arc::clone(&state),
        cfg.status_interval,
        cfg.status_timeout,
    )
    .spawn();
    let live = LiveSession {
        writer: writer.clone(),
        state: Arc::clone(&state),
        heartbeat,
    };
    if shared.install(live).is_err() {
        return ReplicationError::Task("client is shutting down".into());
    }

    let err = run_receive_loop(&mut reader, &writer, &state, handler, cfg.idle_timeout).await;

    // Dropping the live session stops its heartbeat.
    drop(shared.take());
    err
}
