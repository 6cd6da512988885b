use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use palaver_server::{App, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "palaver", about = "Topic-based messaging server")]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the client-facing listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            ServerConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let app = App::start(config).await.context("starting application")?;

    palaver_server::ws::serve(app, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received");
    })
    .await
    .context("serving")?;

    Ok(())
}
