use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pw_domain::config::Config;
use pw_gateway::{api, bootstrap};

#[derive(Debug, Parser)]
#[command(name = "planweaver", about = "LLM planning agent core", version)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when absent.
    #[arg(long, default_value = "planweaver.toml")]
    config: PathBuf,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the SQLite database path.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.persistence.db_path = db;
    }

    for issue in config.validate() {
        tracing::warn!(issue = %issue, "config validation issue");
    }

    let config = Arc::new(config);
    let state = bootstrap::build_state(config.clone())?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "planweaver listening");

    axum::serve(listener, api::router(state)).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pw_gateway=debug")),
        )
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
