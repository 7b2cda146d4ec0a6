use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

mod engine;
mod error;
mod models;
mod server;
mod session;
mod settings;
mod storage;

use engine::ChatEngine;
use settings::AppConfig;
use storage::JsonlSessionStore;

#[derive(Debug, Parser)]
#[command(name = "chat_relay")]
#[command(about = "Streaming chat backend with append-only chat logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// Overrides DATA_DIR.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env is fine
    dotenv::dotenv().ok();

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, data_dir } => {
            let addr: SocketAddr = listen.parse()?;
            let mut config = AppConfig::from_env();
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if !config.has_provider() {
                tracing::warn!("GROQ_API_KEY not set, replies come from the local echo streamer");
            }

            let store = JsonlSessionStore::initialize(&config.data_dir).await?;
            tracing::info!(
                data_dir = %store.dir().display(),
                default_model = config.default_model(),
                "chat store ready"
            );

            let provider = models::provider_for(&config);
            let engine = ChatEngine::new(Arc::new(store), provider, Arc::new(config));
            let metrics = PrometheusBuilder::new().install_recorder()?;
            let state = server::AppState::new(engine).with_metrics(metrics);
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
