//! Standalone signaling relay.
//!
//! The process-wide server instance lives here, at the entry point; library
//! code stays free of singletons.

use conclave_core::rbac::AllowAllGuard;
use conclave_signaling::{BearerTokenValidator, SignalingServer, SignalingServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = SignalingServerConfig::default();
    if let Ok(addr) = std::env::var("CONCLAVE_SIGNALING_ADDR") {
        config.bind_addr = addr.parse()?;
    }

    let server = SignalingServer::bind(
        config,
        Arc::new(AllowAllGuard),
        Arc::new(BearerTokenValidator),
    )
    .await?;

    server.run().await?;
    Ok(())
}
