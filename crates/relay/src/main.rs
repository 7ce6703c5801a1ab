use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay::{JwtVerifier, RelayConfig, RelayHooks, Supervisor, TokenVerifier};

/// Real-time WebSocket fan-out service.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    let verifier: Option<Arc<dyn TokenVerifier>> = config
        .auth
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn TokenVerifier>);
    if verifier.is_none() && config.auth.required {
        anyhow::bail!("auth.required is set but no auth.jwt_secret is configured");
    }

    let supervisor = Arc::new(Supervisor::new(config, verifier, RelayHooks::new()));

    let shutdown = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    supervisor.run().await?;
    Ok(())
}
