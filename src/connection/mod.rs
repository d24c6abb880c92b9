//! The connection contract the replication core is written against.
//!
//! The core never touches sockets. It asks a [`Connector`] for a
//! replication-mode [`ReplicationConnection`], runs plain commands on it,
//! then turns it into a copy-both stream split into one [`FrameReader`]
//! and one [`FrameWriter`]. [`postgres::PgConnector`] is the implementation
//! that speaks to a real server.

pub mod postgres;

use std::future::Future;

use bytes::Bytes;

use crate::config::ClientConfig;
use crate::error::Result;

pub use postgres::PgConnector;

/// Rows returned by a simple-query command, as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<Vec<Option<String>>>,
    /// `CommandComplete` tag of the last statement.
    pub command_tag: Option<String>,
}

impl QueryResult {
    /// Text value at (`row`, `col`), `None` if absent or NULL.
    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

/// Opens replication-mode connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: ReplicationConnection;

    fn connect(&self, cfg: &ClientConfig) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// A connected, authenticated session that has not started streaming.
pub trait ReplicationConnection: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Run a replication command (`CREATE_REPLICATION_SLOT`,
    /// `IDENTIFY_SYSTEM`, ...) to completion.
    fn execute(&mut self, command: &str) -> impl Future<Output = Result<QueryResult>> + Send;

    /// Run `START_REPLICATION` and wait until the server has switched to
    /// copy-both mode. Only then is the stream handed out.
    fn start_copy_both(
        self,
        command: &str,
    ) -> impl Future<Output = Result<(Self::Reader, Self::Writer)>> + Send;
}

/// Read side of a copy-both stream.
pub trait FrameReader: Send + 'static {
    /// Wait for the next CopyData payload. `Ok(None)` means the server sent
    /// CopyDone.
    fn read_frame(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// Write side of a copy-both stream.
pub trait FrameWriter: Send + 'static {
    /// Queue one CopyData payload.
    fn write_frame(&mut self, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Queue CopyDone, ending the client half of the stream.
    fn send_copy_end(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}
