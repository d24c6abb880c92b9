use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;

/// Fixed header of a `'w'` frame: tag + start(8) + end(8) + time(8).
pub const CHANGE_HEADER_LEN: usize = 25;
/// Fixed header of a `'k'` frame: tag + end(8) + time(8) + reply(1).
pub const KEEPALIVE_HEADER_LEN: usize = 18;
/// Length of an encoded standby status update.
pub const STATUS_UPDATE_LEN: usize = 34;

/// One chunk of decoded changes (`XLogData`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFrame {
    /// WAL position where this data starts
    pub start_lsn: Lsn,
    /// Current WAL end on the server (may be 0 inside a transaction)
    pub end_lsn: Lsn,
    /// Server clock when the frame was sent
    pub sent_at: SystemTime,
    /// Output plugin payload, untouched
    pub payload: Bytes,
}

/// Server heartbeat (`PrimaryKeepaliveMessage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub end_lsn: Lsn,
    pub sent_at: SystemTime,
    /// If true, the server wants a status update right away
    pub requires_reply: bool,
}

/// A decoded copy-both frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Change(ChangeFrame),
    Keepalive(Keepalive),
    /// Tag byte this client does not understand. Not an error.
    Unknown { tag: u8 },
}

impl Frame {
    /// End LSN carried by the frame, if any.
    #[inline]
    pub fn end_lsn(&self) -> Option<Lsn> {
        match self {
            Frame::Change(c) => Some(c.end_lsn),
            Frame::Keepalive(k) => Some(k.end_lsn),
            Frame::Unknown { .. } => None,
        }
    }

    #[inline]
    pub fn is_change(&self) -> bool {
        matches!(self, Frame::Change(_))
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, Frame::Keepalive(_))
    }

    /// Returns true if this is a keepalive that requests a reply
    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            Frame::Keepalive(Keepalive {
                requires_reply: true,
                ..
            })
        )
    }
}

/// Decode one CopyData payload into a [`Frame`].
///
/// Unknown tags decode to [`Frame::Unknown`]. The only failure is a `'w'`
/// or `'k'` frame shorter than its fixed header (or an empty payload), which
/// leaves the stream unusable.
pub fn decode(payload: Bytes) -> Result<Frame> {
    let Some(&tag) = payload.first() else {
        return Err(ReplicationError::MalformedFrame {
            tag: None,
            len: 0,
            required: 1,
        });
    };

    match tag {
        b'w' => {
            require(tag, &payload, CHANGE_HEADER_LEN)?;
            let mut b = payload;
            b.advance(1);
            let start_lsn = Lsn(b.get_u64());
            let end_lsn = Lsn(b.get_u64());
            let sent_at = pg_micros_to_system_time(b.get_i64());
            Ok(Frame::Change(ChangeFrame {
                start_lsn,
                end_lsn,
                sent_at,
                payload: b,
            }))
        }
        b'k' => {
            require(tag, &payload, KEEPALIVE_HEADER_LEN)?;
            let mut b = &payload[1..];
            let end_lsn = Lsn(b.get_u64());
            let sent_at = pg_micros_to_system_time(b.get_i64());
            let requires_reply = b.get_u8() != 0;
            Ok(Frame::Keepalive(Keepalive {
                end_lsn,
                sent_at,
                requires_reply,
            }))
        }
        other => Ok(Frame::Unknown { tag: other }),
    }
}

fn require(tag: u8, payload: &[u8], required: usize) -> Result<()> {
    if payload.len() < required {
        return Err(ReplicationError::MalformedFrame {
            tag: Some(tag),
            len: payload.len(),
            required,
        });
    }
    Ok(())
}

/// Encode a standby status update, or `None` when there is nothing to report.
///
/// The written, flushed and applied positions are all `lsn`; this client
/// does not track them separately. The trailing reply-request byte is
/// always 0.
pub fn encode_status_update(lsn: Option<Lsn>, send_time: SystemTime) -> Option<Bytes> {
    let lsn = lsn?;
    let mut out = BytesMut::with_capacity(STATUS_UPDATE_LEN);
    out.put_u8(b'r');
    // written / flushed / applied
    for _ in 0..3 {
        out.put_u64(lsn.0);
    }
    out.put_i64(system_time_to_pg_micros(send_time));
    out.put_u8(0);
    Some(out.freeze())
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// 2000-01-01T00:00:00Z.
pub fn pg_epoch() -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(PG_EPOCH_MICROS as u64)
}

/// Convert microseconds since 2000-01-01 to a [`SystemTime`].
///
/// Values the platform cannot represent fall back to the PostgreSQL epoch.
pub fn pg_micros_to_system_time(micros: i64) -> SystemTime {
    let epoch = pg_epoch();
    let offset = Duration::from_micros(micros.unsigned_abs());
    let t = if micros >= 0 {
        epoch.checked_add(offset)
    } else {
        epoch.checked_sub(offset)
    };
    t.unwrap_or(epoch)
}

/// Convert a [`SystemTime`] to signed microseconds since 2000-01-01.
pub fn system_time_to_pg_micros(t: SystemTime) -> i64 {
    match t.duration_since(pg_epoch()) {
        Ok(after) => i64::try_from(after.as_micros()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_micros())
            .map(|m| -m)
            .unwrap_or(i64::MIN),
    }
}
