mod config;
mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Self-replicating content-addressed blob store node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Inspect or change the cluster-wide config
    Config {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml", global = true)]
        config: String,

        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current cluster config as JSON
    Show,
    /// Set one cluster parameter, e.g. `gc_freq 1h`
    Set { name: String, value: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cairn=info,cairn_core=info,cairn_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Cairn server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Config { config, action } => {
            if let Err(e) = config_command(&config, action).await {
                tracing::error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn config_command(path: &str, action: ConfigAction) -> anyhow::Result<()> {
    let cfg = Config::from_file(path).context("failed to load config")?;
    std::fs::create_dir_all(&cfg.data_dir)?;
    let store = cfg
        .store
        .builder(&cfg.data_dir)
        .build()
        .await
        .context("failed to open metadata store")?;

    let cluster = match action {
        ConfigAction::Show => cairn_core::load_cluster_config(store.as_ref()).await?,
        ConfigAction::Set { name, value } => {
            let updated = cairn_core::update_cluster_parameter(store.as_ref(), &name, &value)
                .await
                .with_context(|| format!("failed to set {}", name))?;
            tracing::info!("Updated cluster parameter {}={}", name, value);
            updated
        }
    };
    println!("{}", serde_json::to_string_pretty(&cluster)?);
    Ok(())
}
