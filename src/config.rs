use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ReplicationError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = ReplicationError;

    /// libpq `sslmode` spelling. `allow` is treated as `prefer`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(ReplicationError::Config(format!("unknown sslmode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub mode: SslMode,
    pub ca_pem_path: Option<PathBuf>,
    pub sni_hostname: Option<String>,
    /// Client certificate chain for mutual TLS.
    pub client_cert_pem_path: Option<PathBuf>,
    pub client_key_pem_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self {
            mode: SslMode::Disable,
            ca_pem_path: None,
            sni_hostname: None,
            client_cert_pem_path: None,
            client_key_pem_path: None,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,
    pub application_name: String,

    pub tls: TlsConfig,

    /// Replication slot to attach to.
    pub slot: String,
    /// Server-side output plugin used when the slot is created.
    pub plugin: String,
    /// Option list appended verbatim to `START_REPLICATION`, e.g.
    /// `("include-types" 'false')`. Empty for none.
    pub plugin_options: String,
    /// Issue `CREATE_REPLICATION_SLOT` on every (re)connect.
    pub create_slot: bool,

    /// How often to send standby status updates.
    pub status_interval: Duration,
    /// Budget for a single status update send.
    pub status_timeout: Duration,
    /// If set, no frame for this long ends the session.
    pub idle_timeout: Option<Duration>,

    /// Pacing for connection attempts and session restarts.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: String::new(),
            database: "postgres".into(),
            application_name: "pg-logical".into(),
            tls: TlsConfig::disabled(),

            slot: "pg_logical_test".into(),
            plugin: "wal2json".into(),
            plugin_options: r#"("include-types" 'false', "pretty-print" 'true')"#.into(),
            create_slot: true,

            status_interval: Duration::from_secs(10),
            status_timeout: Duration::from_secs(2),
            idle_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            database: database.into(),
            slot: slot.into(),
            ..Self::default()
        }
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>, options: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self.plugin_options = options.into();
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check everything that would otherwise only fail on the server.
    pub fn validate(&self) -> Result<()> {
        validate_slot_name(&self.slot)?;
        if self.plugin.is_empty() && self.create_slot {
            return Err(ReplicationError::Config(
                "plugin must be set when create_slot is enabled".into(),
            ));
        }
        if self.status_interval.is_zero() {
            return Err(ReplicationError::Config(
                "status_interval must be non-zero".into(),
            ));
        }
        if self.status_timeout.is_zero() || self.status_timeout > self.status_interval {
            return Err(ReplicationError::Config(format!(
                "status_timeout {:?} must be non-zero and at most status_interval {:?}",
                self.status_timeout, self.status_interval
            )));
        }
        Ok(())
    }

    /// `host=.. port=.. user=.. dbname=.. slot=..` without the password.
    pub fn describe(&self) -> String {
        format!(
            "host={} port={} user={} dbname={} slot={} status_interval={:?}",
            self.host, self.port, self.user, self.database, self.slot, self.status_interval
        )
    }
}

/// PostgreSQL accepts only lower-case letters, digits and underscores in
/// slot names, up to NAMEDATALEN - 1 bytes.
pub fn validate_slot_name(slot: &str) -> Result<()> {
    if slot.is_empty() || slot.len() > 63 {
        return Err(ReplicationError::Config(format!(
            "slot name must be 1..=63 bytes, got {}",
            slot.len()
        )));
    }
    if let Some(c) = slot
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(ReplicationError::Config(format!(
            "slot name {slot:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}
