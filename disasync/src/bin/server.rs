//! disasync relay binary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use disasync::fs::ensure_directory_exists;
use disasync::server::EventLog;
use disasync::tracing_util::{self, Format};
use disasync::{Server, ServerConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "disasync-server")]
#[command(about = "Event relay for collaboratively edited disassembly databases")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    listen_address: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of peers
    #[arg(long)]
    max_peers: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable JSON logging
    #[arg(long)]
    json: bool,

    /// Also write JSON logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let format = if cli.json { Format::Json } else { Format::Raw };
    tracing_util::init(level, format, cli.log_dir.as_deref())?;

    info!("Starting disasync server v{}", env!("CARGO_PKG_VERSION"));

    let command = cli.command.clone().unwrap_or(Commands::Run);
    match command {
        Commands::Run => run_server(load_config(&cli)?).await?,
        Commands::GenerateConfig { output } => generate_config(output)?,
        Commands::Migrate => migrate(load_config(&cli)?)?,
    }

    Ok(())
}

/// Reads the configuration file, if any, and applies command line overrides.
fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(config_path) if config_path.exists() => {
            info!("Loading configuration from {}", config_path.display());
            ServerConfig::read(config_path).with_context(|| {
                format!("failed to read config file {}", config_path.display())
            })?
        }
        Some(config_path) => {
            warn!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            ServerConfig::default()
        }
        None => {
            info!("No configuration file specified, using defaults");
            ServerConfig::default()
        }
    };

    if let Some(database_path) = &cli.database {
        config.database_path = database_path.clone();
    }
    if let Some(listen_address) = &cli.listen_address {
        config.listen_address = listen_address.clone();
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }

    Ok(config)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!("Server configuration:");
    info!("  Database: {}", config.database_path.display());
    info!("  Listen: {}:{}", config.listen_address, config.listen_port);
    info!("  Max peers: {}", config.max_peers);

    ensure_directory_exists(&config.database_path)?;
    let server = Server::bind(config)
        .await
        .context("failed to start the relay")?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
                return Err(e.into());
            }
            info!("Server completed successfully");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for the shutdown signal")?;
            info!("Shutting down server gracefully");
        }
    }

    Ok(())
}

fn migrate(config: ServerConfig) -> Result<()> {
    ensure_directory_exists(&config.database_path)?;
    let log = EventLog::open(&config.database_path).with_context(|| {
        format!(
            "failed to migrate database {}",
            config.database_path.display()
        )
    })?;

    info!(
        version = %log.schema_version()?,
        "Database {} is up to date",
        config.database_path.display()
    );
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = ServerConfig::default();
    let config_toml = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            ensure_directory_exists(&path)?;
            std::fs::write(&path, config_toml)?;
            info!("Generated configuration file: {}", path.display());
        }
        None => {
            println!("{}", config_toml);
        }
    }

    Ok(())
}
