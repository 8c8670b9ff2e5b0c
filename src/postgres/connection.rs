// ABOUTME: PostgreSQL connection setup with TLS and retry
// ABOUTME: TLS verification policy is chosen once per process from the CLI flag

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy. Only the first call has any effect.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized; ignoring");
    }
    if allow_self_signed_certs {
        tracing::warn!("TLS certificate verification is disabled (--allow-self-signed-certs)");
    }
}

pub(crate) fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Connect to PostgreSQL and spawn the connection driver task.
///
/// TLS is negotiated according to the URL's `sslmode`; certificate checks follow the
/// policy set by [`init_tls_policy`].
pub async fn connect(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls).await.with_context(|| {
        format!(
            "Failed to connect to {}",
            crate::utils::redact_url(url)
        )
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with up to three retries and exponential backoff starting at one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    crate::utils::retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}
