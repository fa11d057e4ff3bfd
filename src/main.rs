use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "Autonomous build orchestrator")]
pub struct Cli {
    /// Path to orchestrator.toml (defaults to .forge/orchestrator.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build orchestrator HTTP server
    Serve {
        /// Override the configured bind address, e.g. 0.0.0.0:9090
        #[arg(long)]
        bind: Option<String>,
    },
    /// Open the database and run pending migrations, then exit
    Migrate,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(".forge/orchestrator.toml"));
    let mut config = forge::factory::config::OrchestratorConfig::load(&config_path)
        .context("failed to load orchestrator configuration")?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            forge::factory::server::start_server(config).await?;
        }
        Commands::Migrate => {
            config.ensure_directories()?;
            forge::factory::db::DbHandle::new(&config.db_path)
                .context("failed to open database")?;
            println!("Database ready at {}", config.db_path.display());
        }
    }

    Ok(())
}
