//! Voice Agent - Real-time Conversational Voice Pipeline
//!
//! Server binary entry point.

use voice_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install Rustls crypto provider for TLS (required for Rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install Rustls crypto provider");

    // Initialize logging (INFO level by default, override via RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    cli::run().await
}
