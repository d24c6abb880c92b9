use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ReplicationError, Result};

/// Protocol 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;
const SSL_REQUEST_CODE: i32 = 80_877_103;
/// Upper bound for a single backend message; anything larger is treated as
/// stream corruption rather than allocated.
const MAX_BACKEND_MESSAGE: usize = 1 << 30;

/// CopyDone, complete with its length word.
pub const COPY_DONE: [u8; 5] = [b'c', 0, 0, 0, 4];

#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

pub async fn read_backend_message<R: AsyncRead + Unpin>(rd: &mut R) -> Result<BackendMessage> {
    let mut hdr = [0u8; 5];
    rd.read_exact(&mut hdr).await?;
    let tag = hdr[0];
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    if len < 4 || len as usize > MAX_BACKEND_MESSAGE {
        return Err(ReplicationError::Protocol(format!(
            "invalid backend message length {len} for tag '{}'",
            tag as char
        )));
    }
    let mut buf = vec![0u8; len as usize - 4];
    rd.read_exact(&mut buf).await?;
    Ok(BackendMessage {
        tag,
        payload: Bytes::from(buf),
    })
}

/// Append a tagged frontend message (`tag`, length, body) to `buf`.
pub fn put_message(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.reserve(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32((body.len() + 4) as i32);
    buf.extend_from_slice(body);
}

/// Encode a CopyData message wrapping `payload`.
pub fn encode_copy_data(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    put_message(&mut buf, b'd', payload);
    buf
}

async fn send<W: AsyncWrite + Unpin>(wr: &mut W, buf: &[u8]) -> Result<()> {
    wr.write_all(buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_ssl_request<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&8i32.to_be_bytes());
    buf[4..8].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    send(wr, &buf).await
}

pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);

    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    send(wr, &buf).await
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut body = Vec::with_capacity(sql.len() + 1);
    body.extend_from_slice(sql.as_bytes());
    body.push(0);
    let mut buf = BytesMut::new();
    put_message(&mut buf, b'Q', &body);
    send(wr, &buf).await
}

pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    let mut buf = BytesMut::new();
    put_message(&mut buf, b'p', payload);
    send(wr, &buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_data_frame_layout() {
        let buf = encode_copy_data(b"abc");
        assert_eq!(&buf[..], &[b'd', 0, 0, 0, 7, b'a', b'b', b'c']);
    }

    #[test]
    fn copy_done_constant_matches_put_message() {
        let mut buf = BytesMut::new();
        put_message(&mut buf, b'c', &[]);
        assert_eq!(&buf[..], &COPY_DONE);
    }

    #[tokio::test]
    async fn read_backend_message_roundtrip() {
        let mut wire = Vec::new();
        wire.push(b'Z');
        wire.extend_from_slice(&5i32.to_be_bytes());
        wire.push(b'I');
        let mut rd = &wire[..];
        let msg = read_backend_message(&mut rd).await.unwrap();
        assert_eq!(msg.tag, b'Z');
        assert_eq!(&msg.payload[..], b"I");
    }

    #[tokio::test]
    async fn read_backend_message_rejects_bad_length() {
        let wire = [b'd', 0, 0, 0, 2];
        let mut rd = &wire[..];
        let err = read_backend_message(&mut rd).await.unwrap_err();
        assert!(err.to_string().contains("invalid backend message length"));
    }

    #[tokio::test]
    async fn write_query_is_nul_terminated() {
        let mut out = Vec::new();
        write_query(&mut out, "IDENTIFY_SYSTEM").await.unwrap();
        assert_eq!(out[0], b'Q');
        assert_eq!(i32::from_be_bytes([out[1], out[2], out[3], out[4]]) as usize, out.len() - 1);
        assert_eq!(*out.last().unwrap(), 0);
    }
}
