use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tablero::config::Settings;
use tablero::db::{DbHandle, Store};
use tablero::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "tablero")]
#[command(version, about = "Backlog and Kanban board service")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config file (defaults to ./tablero.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Create the database file and the initial OWNER account, then exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            let settings = Settings::load(cli.config.as_deref(), port, db_path, dev)?;
            server::start_server(ServerConfig {
                port: settings.port,
                db_path: settings.db_path,
                dev_mode: settings.dev_mode,
            })
            .await
        }
        Commands::InitDb { db_path } => {
            let settings = Settings::load(cli.config.as_deref(), None, db_path, false)?;
            if let Some(parent) = settings.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create database directory")?;
                }
            }
            let store =
                Store::open(&settings.db_path).context("Failed to initialize database")?;
            server::bootstrap_owner(&DbHandle::new(store))?;
            println!("Database initialized at {}", settings.db_path.display());
            Ok(())
        }
    }
}
