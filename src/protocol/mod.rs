//! PostgreSQL wire protocol pieces used by the replication client.
//!
//! - [`replication`]: the copy-both sub-protocol codec (change frames,
//!   keepalives, standby status updates). Pure functions over bytes.
//! - [`framing`]: frontend/backend message framing used by the default
//!   connector.
//! - [`messages`]: parsers for error responses, auth requests and query
//!   results.
//!
//! # Replication frames
//!
//! Inside CopyData, the server sends `'w'` (XLogData) and `'k'` (primary
//! keepalive) frames; the client answers with `'r'` (standby status
//! update). All integers are big-endian and timestamps are microseconds
//! since 2000-01-01T00:00:00Z.

pub mod framing;
pub mod messages;
pub mod replication;

pub use framing::BackendMessage;
pub use messages::parse_error_response;
pub use replication::{
    ChangeFrame, Frame, Keepalive, PG_EPOCH_MICROS, decode, encode_status_update,
    pg_micros_to_system_time, system_time_to_pg_micros,
};
