//! PostgreSQL logical replication client.
//!
//! [`ReplicationClient`] connects in replication mode, creates the slot if
//! needed, starts streaming and hands every change frame to a
//! [`ChangeHandler`]. Progress is acknowledged to the server with standby
//! status updates, both periodically and whenever a keepalive asks for one.
//! Sessions that fail are torn down and re-established from the slot's
//! confirmed position.
//!
//! ```no_run
//! use pg_logical::{ClientConfig, ReplicationClient};
//!
//! # async fn run() {
//! let cfg = ClientConfig::new("localhost", "postgres", "secret", "postgres", "my_slot");
//! let mut client = ReplicationClient::connect_default(cfg, |change: pg_logical::ChangeFrame| {
//!     println!("{} {}", change.end_lsn, String::from_utf8_lossy(&change.payload));
//! });
//! let fatal = client.wait().await;
//! eprintln!("replication stopped: {fatal}");
//! # }
//! ```

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod lsn;
pub mod protocol;
pub mod receiver;
pub mod retry;
pub mod session;
pub mod state;
pub mod tls;

pub use client::ReplicationClient;
pub use config::{ClientConfig, SslMode, TlsConfig};
pub use connection::{Connector, FrameReader, FrameWriter, PgConnector, QueryResult, ReplicationConnection};
pub use error::{ReplicationError, Result, ServerError};
pub use heartbeat::{HeartbeatHandle, HeartbeatOutcome, HeartbeatScheduler};
pub use lsn::Lsn;
pub use protocol::{ChangeFrame, Frame, Keepalive};
pub use receiver::{ChangeHandler, run_receive_loop};
pub use retry::RetryPolicy;
pub use session::{Session, SessionManager, SlotStatus, StatusReport, SystemIdentity, WritePath};
pub use state::{ProgressSnapshot, ReplicationState};
