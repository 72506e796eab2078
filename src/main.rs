//! StreamXR process entry point: loads config from the environment, builds the Hub, and serves
//! the HTTP admin surface plus the `/ws` duplex session upgrade on one bound address.

use std::process::ExitCode;

use streamxr_core::config::{ServerConfig, StreamingConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let server_config = ServerConfig::from_env();
    let streaming_config = StreamingConfig::default();

    let hub = streamxr_core::build_hub(&server_config)?;
    let app = streamxr_core::app(hub, streaming_config);

    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr).await?;
    tracing::info!(
        addr = %server_config.bind_addr,
        asset_root = %server_config.asset_root.display(),
        cache_root = %server_config.cache_root.display(),
        max_sessions = server_config.max_sessions,
        "StreamXR listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
