//! Connection setup for one replication session: connect with retry,
//! make sure the slot exists, identify the server and switch to streaming.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connector, FrameWriter, QueryResult, ReplicationConnection};
use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;
use crate::protocol::encode_status_update;
use crate::state::ReplicationState;

/// The single write side of a copy-both stream, shared by the receive loop
/// and the heartbeat.
///
/// Every status update or CopyDone holds the lock for one write plus one
/// flush, so frames from different tasks never interleave. Once the lock is
/// held the write runs on its own task: a caller that gives up waiting
/// (a timed-out heartbeat, a bounded shutdown) never leaves half a frame on
/// the wire, and the next writer queues behind the unfinished one.
pub struct WritePath<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for WritePath<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A standby status update that reached the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub lsn: Lsn,
    pub sent_at: SystemTime,
}

enum WriteOp {
    Frame(Bytes),
    CopyDone,
    Close,
}

impl WriteOp {
    async fn apply<W: FrameWriter>(self, w: &mut W) -> Result<()> {
        match self {
            WriteOp::Frame(frame) => {
                w.write_frame(&frame).await?;
                w.flush().await
            }
            WriteOp::CopyDone => {
                w.send_copy_end().await?;
                w.flush().await
            }
            WriteOp::Close => w.close().await,
        }
    }
}

impl<W: FrameWriter> WritePath<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Report `state`'s current position to the server.
    ///
    /// Returns `Ok(None)` without writing anything while no position has been
    /// observed yet. On success `last_report_at` is updated.
    pub async fn send_status_update(&self, state: &ReplicationState) -> Result<Option<StatusReport>> {
        let Some(lsn) = state.current_lsn() else {
            return Ok(None);
        };
        let sent_at = SystemTime::now();
        let Some(frame) = encode_status_update(Some(lsn), sent_at) else {
            return Ok(None);
        };

        self.submit(WriteOp::Frame(frame)).await?;
        state.record_report(sent_at);
        Ok(Some(StatusReport { lsn, sent_at }))
    }

    /// Send CopyDone, ending the client half of the stream.
    pub async fn finish(&self) -> Result<()> {
        self.submit(WriteOp::CopyDone).await
    }

    /// Shut the underlying transport down for writing.
    pub async fn close(&self) -> Result<()> {
        self.submit(WriteOp::Close).await
    }

    async fn submit(&self, op: WriteOp) -> Result<()> {
        // Nothing is written while waiting here, so this await may be dropped.
        let mut guard = Arc::clone(&self.inner).lock_owned().await;
        let write = tokio::spawn(async move { op.apply(&mut *guard).await }.in_current_span());
        write
            .await
            .map_err(|e| ReplicationError::Task(format!("write task failed: {e}")))?
    }
}

/// Outcome of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Created,
    AlreadyExists,
}

/// Row returned by `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    /// Current WAL flush position on the server.
    pub xlog_pos: Lsn,
    /// `None` for physical replication connections.
    pub database: Option<String>,
}

impl SystemIdentity {
    pub fn from_query(result: &QueryResult) -> Result<Self> {
        let system_id = column(result, 0, "systemid")?.to_string();
        let timeline = column(result, 1, "timeline")?
            .parse::<u32>()
            .map_err(|e| ReplicationError::Protocol(format!("IDENTIFY_SYSTEM timeline: {e}")))?;
        let xlog_pos = Lsn::parse(column(result, 2, "xlogpos")?)
            .map_err(|e| ReplicationError::Protocol(format!("IDENTIFY_SYSTEM xlogpos: {e}")))?;
        let database = result.get(0, 3).map(str::to_string);

        Ok(Self {
            system_id,
            timeline,
            xlog_pos,
            database,
        })
    }
}

fn column<'a>(result: &'a QueryResult, col: usize, name: &str) -> Result<&'a str> {
    result
        .get(0, col)
        .ok_or_else(|| ReplicationError::Protocol(format!("IDENTIFY_SYSTEM returned no {name}")))
}

/// A streaming session: the read half, the shared write path and the
/// session's progress. Progress starts unset on every new session.
pub struct Session<T: ReplicationConnection> {
    pub reader: T::Reader,
    pub writer: WritePath<T::Writer>,
    pub state: Arc<ReplicationState>,
    pub identity: SystemIdentity,
}

/// Drives the handshake that turns a configuration into a [`Session`].
pub struct SessionManager<C> {
    config: ClientConfig,
    connector: C,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(config: ClientConfig, connector: C) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a replication connection, retrying per the configured
    /// [`RetryPolicy`](crate::retry::RetryPolicy).
    ///
    /// The configuration is validated first; an invalid configuration is
    /// returned without contacting the server.
    pub async fn connect(&self) -> Result<C::Connection> {
        self.config.validate()?;

        let mut backoff = self.config.retry.backoff();
        loop {
            match self.connector.connect(&self.config).await {
                Ok(conn) => {
                    if backoff.failures() > 0 {
                        info!(failures = backoff.failures(), "connected after retrying");
                    }
                    return Ok(conn);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, attempt = backoff.failures(), ?delay, "connect failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ReplicationError::RetryExhausted {
                            attempts: backoff.failures(),
                            last: Box::new(e),
                        });
                    }
                },
            }
        }
    }

    /// Create the configured logical slot, treating "already exists" as
    /// success. Any other server error is [`ReplicationError::SlotCreation`].
    pub async fn ensure_slot(&self, conn: &mut C::Connection) -> Result<SlotStatus> {
        let slot = &self.config.slot;
        validate_identifier(&self.config.plugin, "plugin")?;
        let cmd = format!("CREATE_REPLICATION_SLOT {slot} LOGICAL {}", self.config.plugin);

        match conn.execute(&cmd).await {
            Ok(res) => {
                let consistent_point = res.get(0, 1).unwrap_or("?");
                info!(%slot, plugin = %self.config.plugin, consistent_point, "created replication slot");
                Ok(SlotStatus::Created)
            }
            Err(ReplicationError::Server(e)) if e.is_already_exists() => {
                warn!(%slot, "replication slot already exists: {e}");
                Ok(SlotStatus::AlreadyExists)
            }
            Err(ReplicationError::Server(error)) => Err(ReplicationError::SlotCreation {
                slot: slot.clone(),
                error,
            }),
            Err(e) => Err(e),
        }
    }

    /// Identify the server, then start streaming from the slot's confirmed
    /// position.
    pub async fn start_streaming(&self, mut conn: C::Connection) -> Result<Session<C::Connection>> {
        let identity = SystemIdentity::from_query(&conn.execute("IDENTIFY_SYSTEM").await?)?;
        info!(
            system_id = %identity.system_id,
            timeline = identity.timeline,
            xlog_pos = %identity.xlog_pos,
            "identified server"
        );

        let cmd = start_replication_command(&self.config);
        debug!(command = %cmd, "starting replication");
        let (reader, writer) = conn.start_copy_both(&cmd).await?;
        info!(slot = %self.config.slot, "streaming started");

        Ok(Session {
            reader,
            writer: WritePath::new(writer),
            state: Arc::new(ReplicationState::new()),
            identity,
        })
    }

    /// Connect, create the slot when configured to, and start streaming.
    pub async fn establish(&self) -> Result<Session<C::Connection>> {
        let mut conn = self.connect().await?;
        if self.config.create_slot {
            self.ensure_slot(&mut conn).await?;
        }
        self.start_streaming(conn).await
    }
}

/// `START_REPLICATION SLOT <slot> LOGICAL 0/0 [options]`.
///
/// `0/0` is behind any confirmed position, so the server resumes from the
/// slot's own `confirmed_flush_lsn`.
pub fn start_replication_command(cfg: &ClientConfig) -> String {
    let mut cmd = format!("START_REPLICATION SLOT {} LOGICAL {}", cfg.slot, Lsn::ZERO);
    let opts = cfg.plugin_options.trim();
    if !opts.is_empty() {
        cmd.push(' ');
        cmd.push_str(opts);
    }
    cmd
}

fn validate_identifier(value: &str, what: &str) -> Result<()> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ReplicationError::Config(format!("invalid {what} name {value:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_row(cols: &[Option<&str>]) -> QueryResult {
        QueryResult {
            rows: vec![cols.iter().map(|c| c.map(str::to_string)).collect()],
            command_tag: Some("IDENTIFY_SYSTEM".into()),
        }
    }

    #[test]
    fn parses_identify_system() {
        let id = SystemIdentity::from_query(&identify_row(&[
            Some("7311495361063325722"),
            Some("1"),
            Some("0/16B6C50"),
            Some("postgres"),
        ]))
        .unwrap();
        assert_eq!(id.timeline, 1);
        assert_eq!(id.xlog_pos, Lsn(0x16B_6C50));
        assert_eq!(id.database.as_deref(), Some("postgres"));
    }

    #[test]
    fn identify_system_requires_position() {
        let err = SystemIdentity::from_query(&identify_row(&[Some("1"), Some("1"), None, None]))
            .unwrap_err();
        assert!(err.to_string().contains("xlogpos"));
        assert!(SystemIdentity::from_query(&QueryResult::default()).is_err());
    }

    #[test]
    fn start_command_includes_options() {
        let cfg = ClientConfig::default();
        assert_eq!(
            start_replication_command(&cfg),
            r#"START_REPLICATION SLOT pg_logical_test LOGICAL 0/0 ("include-types" 'false', "pretty-print" 'true')"#
        );

        let cfg = ClientConfig::default().with_plugin("test_decoding", "");
        assert_eq!(
            start_replication_command(&cfg),
            "START_REPLICATION SLOT pg_logical_test LOGICAL 0/0"
        );
    }

    #[test]
    fn plugin_names_are_checked() {
        validate_identifier("wal2json", "plugin").unwrap();
        validate_identifier("test_decoding", "plugin").unwrap();
        assert!(validate_identifier("x; DROP", "plugin").is_err());
    }
}
