//! Print every change of a logical slot to stdout.
//!
//! PGSLOT=my_slot PGPLUGIN=test_decoding PGOPTIONS= \
//!     cargo run --example stream_to_stdout --features examples

use std::path::PathBuf;
use std::time::Duration;

use pg_logical::{ChangeFrame, ClientConfig, ReplicationClient, SslMode, TlsConfig};
use tracing_subscriber::EnvFilter;

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let defaults = ClientConfig::default();
    let mut cfg = ClientConfig::new(
        env("PGHOST", &defaults.host),
        env("PGUSER", &defaults.user),
        env("PGPASSWORD", &defaults.password),
        env("PGDATABASE", &defaults.database),
        env("PGSLOT", &defaults.slot),
    )
    .with_plugin(
        env("PGPLUGIN", &defaults.plugin),
        env("PGOPTIONS", &defaults.plugin_options),
    )
    .with_status_interval(Duration::from_secs(env("PGSTATUS_INTERVAL_SECS", "10").parse()?));
    cfg.port = env("PGPORT", "5432").parse()?;
    cfg.tls = TlsConfig {
        mode: env("PGSSLMODE", "disable").parse::<SslMode>()?,
        ca_pem_path: env_path("PGSSLROOTCERT"),
        sni_hostname: std::env::var("PGSSLSNI").ok(),
        client_cert_pem_path: env_path("PGSSLCERT"),
        client_key_pem_path: env_path("PGSSLKEY"),
    };

    let mut client = ReplicationClient::connect_default(cfg, |change: ChangeFrame| {
        println!(
            "{} {}",
            change.end_lsn,
            String::from_utf8_lossy(&change.payload)
        );
    });

    let fatal = tokio::select! {
        fatal = client.wait() => Some(fatal),
        _ = tokio::signal::ctrl_c() => None,
    };
    match fatal {
        Some(e) => {
            tracing::error!("replication stopped: {e}");
            std::process::exit(1);
        }
        None => client.shutdown().await,
    }
    Ok(())
}
