//! [`Connector`] over the PostgreSQL frontend/backend protocol.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::{Connector, FrameReader, FrameWriter, QueryResult, ReplicationConnection};
use crate::auth::authenticate;
use crate::config::ClientConfig;
use crate::error::{ReplicationError, Result};
use crate::protocol::framing::{
    COPY_DONE, encode_copy_data, read_backend_message, write_query, write_startup_message,
};
use crate::protocol::messages::{parse_command_tag, parse_data_row, parse_error_response};
use crate::tls::{MaybeTlsStream, negotiate};

type Io = BufReader<MaybeTlsStream>;

/// Connects over TCP (optionally TLS) with `replication=database`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    type Connection = PgConnection<Io>;

    async fn connect(&self, cfg: &ClientConfig) -> Result<PgConnection<Io>> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        tcp.set_nodelay(true)?;
        let stream = negotiate(tcp, &cfg.tls, &cfg.host).await?;
        let tls = stream.is_tls();

        let mut io = BufReader::new(stream);
        let params = [
            ("user", cfg.user.as_str()),
            ("database", cfg.database.as_str()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
            ("application_name", cfg.application_name.as_str()),
        ];
        write_startup_message(&mut io, &params).await?;
        authenticate(&mut io, &cfg.user, &cfg.password).await?;

        debug!(host = %cfg.host, port = cfg.port, tls, "replication connection ready");
        Ok(PgConnection { io })
    }
}

/// Authenticated replication connection in simple-query mode.
pub struct PgConnection<S> {
    io: S,
}

impl<S> PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a stream that has already completed startup and authentication.
    pub fn from_authenticated(io: S) -> Self {
        Self { io }
    }
}

impl<S> ReplicationConnection for PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = PgFrameReader<ReadHalf<S>>;
    type Writer = PgFrameWriter<WriteHalf<S>>;

    async fn execute(&mut self, command: &str) -> Result<QueryResult> {
        write_query(&mut self.io, command).await?;

        let mut result = QueryResult::default();
        let mut error = None;
        loop {
            let msg = read_backend_message(&mut self.io).await?;
            match msg.tag {
                b'T' => {} // RowDescription: columns are addressed by index
                b'D' => result.rows.push(parse_data_row(&msg.payload)?),
                b'C' => result.command_tag = Some(parse_command_tag(&msg.payload)),
                b'E' => error = Some(parse_error_response(&msg.payload)),
                b'N' => debug!("notice: {}", parse_error_response(&msg.payload)),
                b'I' | b'S' => {}
                b'Z' => break,
                other => trace!("ignoring '{}' during {command}", other as char),
            }
        }

        match error {
            Some(e) => Err(ReplicationError::Server(e)),
            None => Ok(result),
        }
    }

    async fn start_copy_both(mut self, command: &str) -> Result<(Self::Reader, Self::Writer)> {
        write_query(&mut self.io, command).await?;

        loop {
            let msg = read_backend_message(&mut self.io).await?;
            match msg.tag {
                b'W' => break, // CopyBothResponse
                b'E' => return Err(ReplicationError::Server(parse_error_response(&msg.payload))),
                b'N' => debug!("notice: {}", parse_error_response(&msg.payload)),
                b'Z' => {
                    return Err(ReplicationError::Protocol(
                        "server returned to idle without entering copy-both mode".into(),
                    ));
                }
                _ => {}
            }
        }

        let (rd, wr) = tokio::io::split(self.io);
        Ok((PgFrameReader { rd }, PgFrameWriter { wr }))
    }
}

pub struct PgFrameReader<R> {
    rd: R,
}

impl<R> FrameReader for PgFrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let msg = read_backend_message(&mut self.rd).await?;
            match msg.tag {
                b'd' => return Ok(Some(msg.payload)),
                b'c' => return Ok(None),
                b'E' => return Err(ReplicationError::Server(parse_error_response(&msg.payload))),
                b'N' => warn!("notice: {}", parse_error_response(&msg.payload)),
                // In copy-both mode only CopyData is expected; anything else is skipped.
                other => trace!("ignoring '{}' in copy-both mode", other as char),
            }
        }
    }
}

pub struct PgFrameWriter<W> {
    wr: W,
}

impl<W> FrameWriter for PgFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.wr.write_all(&encode_copy_data(payload)).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.wr.flush().await?;
        Ok(())
    }

    async fn send_copy_end(&mut self) -> Result<()> {
        self.wr.write_all(&COPY_DONE).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.wr.shutdown().await?;
        Ok(())
    }
}
