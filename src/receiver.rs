//! The per-session receive loop.

use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::{FrameReader, FrameWriter};
use crate::error::{ReplicationError, Result};
use crate::protocol::{ChangeFrame, Frame, decode};
use crate::session::WritePath;
use crate::state::ReplicationState;

/// Receives every [`ChangeFrame`] of the stream, in order.
///
/// Called inline by the receive loop: the next frame is not read until
/// `on_change` returns, so a slow handler slows the stream down instead of
/// buffering.
pub trait ChangeHandler: Send + 'static {
    fn on_change(&mut self, change: ChangeFrame);
}

impl<F> ChangeHandler for F
where
    F: FnMut(ChangeFrame) + Send + 'static,
{
    fn on_change(&mut self, change: ChangeFrame) {
        self(change)
    }
}

/// Consume `reader` until the session ends, returning the reason.
///
/// Every change frame and keepalive advances `state` by the monotonic-adopt
/// rule before anything else happens. A keepalive that asks for a reply is
/// answered through `writer` before the next frame is read. The loop ends
/// on the first read, decode or write error, on server CopyDone
/// ([`ReplicationError::StreamClosed`]), or when no frame arrives within
/// `idle_timeout`.
pub async fn run_receive_loop<R, W, H>(
    reader: &mut R,
    writer: &WritePath<W>,
    state: &ReplicationState,
    handler: &mut H,
    idle_timeout: Option<Duration>,
) -> ReplicationError
where
    R: FrameReader,
    W: FrameWriter,
    H: ChangeHandler + ?Sized,
{
    loop {
        if let Err(e) = receive_one(reader, writer, state, handler, idle_timeout).await {
            debug!(error = %e, current_lsn = ?state.current_lsn(), "receive loop ended");
            return e;
        }
    }
}

async fn receive_one<R, W, H>(
    reader: &mut R,
    writer: &WritePath<W>,
    state: &ReplicationState,
    handler: &mut H,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: FrameReader,
    W: FrameWriter,
    H: ChangeHandler + ?Sized,
{
    let next = match idle_timeout {
        Some(after) => tokio::time::timeout(after, reader.read_frame())
            .await
            .map_err(|_| ReplicationError::Timeout {
                what: "replication stream idle",
                after,
            })??,
        None => reader.read_frame().await?,
    };
    let Some(bytes) = next else {
        return Err(ReplicationError::StreamClosed);
    };

    match decode(bytes)? {
        Frame::Change(change) => {
            state.observe(change.end_lsn);
            trace!(
                start_lsn = %change.start_lsn,
                end_lsn = %change.end_lsn,
                len = change.payload.len(),
                "change"
            );
            handler.on_change(change);
        }
        Frame::Keepalive(k) => {
            let current = state.observe(k.end_lsn);
            if k.requires_reply {
                if let Some(report) = writer.send_status_update(state).await? {
                    debug!(lsn = %report.lsn, "answered keepalive");
                }
            } else {
                trace!(end_lsn = %k.end_lsn, %current, "keepalive");
            }
        }
        Frame::Unknown { tag } => {
            debug!(tag = %(tag as char), "ignoring unknown replication frame");
        }
    }
    Ok(())
}
