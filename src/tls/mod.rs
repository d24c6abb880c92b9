//! Transport for the default connector: plain TCP or TCP upgraded to TLS.

#[cfg(feature = "tls-rustls")]
pub mod rustls;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::{SslMode, TlsConfig};
use crate::error::Result;

pub enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls-rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, MaybeTlsStream::Plain(_))
    }
}

/// Apply the configured [`SslMode`] to a freshly connected socket.
pub async fn negotiate(tcp: TcpStream, tls: &TlsConfig, host: &str) -> Result<MaybeTlsStream> {
    if tls.mode == SslMode::Disable {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    #[cfg(feature = "tls-rustls")]
    {
        self::rustls::upgrade(tcp, tls, host).await
    }

    #[cfg(not(feature = "tls-rustls"))]
    {
        let _ = host;
        if tls.mode == SslMode::Prefer {
            tracing::warn!("sslmode=prefer but tls-rustls feature disabled; using plain TCP");
            return Ok(MaybeTlsStream::Plain(tcp));
        }
        Err(crate::error::ReplicationError::Tls(
            "tls-rustls feature disabled".into(),
        ))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
