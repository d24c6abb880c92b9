//! Scripted in-memory server shared by the component tests.
//!
//! Every `start_copy_both` hands the test a [`SessionFeed`]: frames pushed
//! into it come out of the session's reader, and everything the client
//! writes shows up on it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use pg_logical::error::{ReplicationError, Result, ServerError};
use pg_logical::retry::RetryPolicy;
use pg_logical::{ClientConfig, Connector, FrameReader, FrameWriter, QueryResult, ReplicationConnection};

pub const WAIT: Duration = Duration::from_secs(120);

pub fn init_tracing() {
    // RUST_LOG=pg_logical=trace cargo test ...
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new("127.0.0.1", "postgres", "postgres", "postgres", "orders_slot")
        .with_retry(RetryPolicy::fixed(Duration::from_secs(1)))
}

pub fn keepalive(end: u64, reply: bool) -> Bytes {
    let mut b = BytesMut::with_capacity(18);
    b.put_u8(b'k');
    b.put_u64(end);
    b.put_i64(0);
    b.put_u8(u8::from(reply));
    b.freeze()
}

pub fn change(start: u64, end: u64, payload: &str) -> Bytes {
    let mut b = BytesMut::with_capacity(25 + payload.len());
    b.put_u8(b'w');
    b.put_u64(start);
    b.put_u64(end);
    b.put_i64(0);
    b.extend_from_slice(payload.as_bytes());
    b.freeze()
}

/// LSN reported by an encoded standby status update.
pub fn status_lsn(frame: &[u8]) -> u64 {
    assert_eq!(frame.len(), 34, "status update length");
    assert_eq!(frame[0], b'r');
    let written = u64::from_be_bytes(frame[1..9].try_into().unwrap());
    assert_eq!(&frame[1..9], &frame[9..17]);
    assert_eq!(&frame[1..9], &frame[17..25]);
    assert_eq!(frame[33], 0);
    written
}

pub enum Step {
    Frame(Bytes),
    End,
    Fail(ReplicationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Data(Bytes),
    CopyDone,
    Close,
}

/// Stalled writes park until un-stalled, then go through.
#[derive(Debug)]
pub struct WriteControl {
    stall: watch::Sender<bool>,
    fail: AtomicBool,
}

impl Default for WriteControl {
    fn default() -> Self {
        Self {
            stall: watch::Sender::new(false),
            fail: AtomicBool::new(false),
        }
    }
}

pub struct SessionFeed {
    frames: UnboundedSender<Step>,
    sent: UnboundedReceiver<Sent>,
    ctl: Arc<WriteControl>,
}

impl SessionFeed {
    pub fn push(&self, frame: Bytes) {
        let _ = self.frames.send(Step::Frame(frame));
    }

    pub fn keepalive(&self, end: u64, reply: bool) {
        self.push(keepalive(end, reply));
    }

    pub fn change(&self, start: u64, end: u64, payload: &str) {
        self.push(change(start, end, payload));
    }

    /// Server CopyDone.
    pub fn end(&self) {
        let _ = self.frames.send(Step::End);
    }

    pub fn fail(&self, err: ReplicationError) {
        let _ = self.frames.send(Step::Fail(err));
    }

    pub fn stall_writes(&self, on: bool) {
        self.ctl.stall.send_replace(on);
    }

    pub fn fail_writes(&self, on: bool) {
        self.ctl.fail.store(on, Ordering::SeqCst);
    }

    pub async fn next_sent(&mut self) -> Sent {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a client write")
            .expect("writer dropped")
    }

    pub fn try_sent(&mut self) -> Option<Sent> {
        self.sent.try_recv().ok()
    }
}

pub struct MockReader {
    rx: UnboundedReceiver<Step>,
}

impl FrameReader for MockReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Step::Frame(b)) => Ok(Some(b)),
            Some(Step::End) => Ok(None),
            Some(Step::Fail(e)) => Err(e),
            None => Err(ReplicationError::Io("connection reset by peer".into())),
        }
    }
}

pub struct MockWriter {
    tx: UnboundedSender<Sent>,
    ctl: Arc<WriteControl>,
}

impl MockWriter {
    async fn gate(&self) -> Result<()> {
        let mut stall = self.ctl.stall.subscribe();
        let _ = stall.wait_for(|stalled| !*stalled).await;
        if self.ctl.fail.load(Ordering::SeqCst) {
            return Err(ReplicationError::Io("broken pipe".into()));
        }
        Ok(())
    }
}

impl FrameWriter for MockWriter {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.gate().await?;
        let _ = self.tx.send(Sent::Data(Bytes::copy_from_slice(payload)));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send_copy_end(&mut self) -> Result<()> {
        self.gate().await?;
        let _ = self.tx.send(Sent::CopyDone);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.tx.send(Sent::Close);
        Ok(())
    }
}

/// A reader/writer pair without any connection around it.
pub fn stream_pair() -> (MockReader, MockWriter, SessionFeed) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let ctl = Arc::new(WriteControl::default());
    (
        MockReader { rx: frames_rx },
        MockWriter {
            tx: sent_tx,
            ctl: Arc::clone(&ctl),
        },
        SessionFeed {
            frames: frames_tx,
            sent: sent_rx,
            ctl,
        },
    )
}

pub enum SlotReply {
    Created,
    Exists,
    Fail(ServerError),
}

struct ServerState {
    connect_failures: u32,
    connects: u32,
    slot_reply: SlotReply,
    commands: Vec<String>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ServerState>>,
    sessions: UnboundedSender<SessionFeed>,
}

pub struct Harness {
    state: Arc<Mutex<ServerState>>,
    sessions: UnboundedReceiver<SessionFeed>,
}

pub fn mock_server(slot_reply: SlotReply) -> (MockConnector, Harness) {
    let state = Arc::new(Mutex::new(ServerState {
        connect_failures: 0,
        connects: 0,
        slot_reply,
        commands: Vec::new(),
    }));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            state: Arc::clone(&state),
            sessions: tx,
        },
        Harness {
            state,
            sessions: rx,
        },
    )
}

impl Harness {
    /// Fail the next `n` connection attempts with an I/O error.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().unwrap().connect_failures = n;
    }

    pub fn set_slot_reply(&self, reply: SlotReply) {
        self.state.lock().unwrap().slot_reply = reply;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub async fn next_session(&mut self) -> SessionFeed {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a session")
            .expect("connector dropped")
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _cfg: &ClientConfig) -> Result<MockConnection> {
        let mut s = self.state.lock().unwrap();
        s.connects += 1;
        if s.connect_failures > 0 {
            s.connect_failures -= 1;
            return Err(ReplicationError::Io("connection refused".into()));
        }
        Ok(MockConnection {
            connector: self.clone(),
        })
    }
}

pub struct MockConnection {
    connector: MockConnector,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection").finish_non_exhaustive()
    }
}

impl MockConnection {
    fn run(&self, command: &str) -> Result<QueryResult> {
        let mut s = self.connector.state.lock().unwrap();
        s.commands.push(command.to_string());

        if command.starts_with("CREATE_REPLICATION_SLOT") {
            return match &s.slot_reply {
                SlotReply::Created => Ok(QueryResult {
                    rows: vec![vec![
                        Some("orders_slot".into()),
                        Some("0/1573178".into()),
                        None,
                        Some("wal2json".into()),
                    ]],
                    command_tag: Some("CREATE_REPLICATION_SLOT".into()),
                }),
                SlotReply::Exists => Err(ReplicationError::Server(
                    ServerError::new("replication slot \"orders_slot\" already exists")
                        .with_code("42710"),
                )),
                SlotReply::Fail(e) => Err(ReplicationError::Server(e.clone())),
            };
        }
        if command == "IDENTIFY_SYSTEM" {
            return Ok(QueryResult {
                rows: vec![vec![
                    Some("7311495361063325722".into()),
                    Some("1".into()),
                    Some("0/16B6C50".into()),
                    Some("postgres".into()),
                ]],
                command_tag: Some("IDENTIFY_SYSTEM".into()),
            });
        }
        Ok(QueryResult::default())
    }
}

impl ReplicationConnection for MockConnection {
    type Reader = MockReader;
    type Writer = MockWriter;

    async fn execute(&mut self, command: &str) -> Result<QueryResult> {
        self.run(command)
    }

    async fn start_copy_both(self, command: &str) -> Result<(MockReader, MockWriter)> {
        self.run(command)?;
        let (reader, writer, feed) = stream_pair();
        let _ = self.connector.sessions.send(feed);
        Ok((reader, writer))
    }
}
