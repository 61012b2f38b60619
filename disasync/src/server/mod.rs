//! Server-side components for disasync

use crate::types::{Error, Result};
use config::{ConfigError, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub mod database;
pub mod event_loop;
pub mod migrations;
pub mod relay;

pub use database::EventLog;
pub use relay::{ConnectionId, Relay};

/// Configuration for the disasync relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path to the event log database
    pub database_path: PathBuf,
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Maximum number of connected peers
    pub max_peers: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("disasync.sqlite"),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 31013,
            max_peers: 100,
        }
    }
}

impl ServerConfig {
    /// Reads a TOML configuration file; missing keys keep their defaults.
    pub fn read(config_file: &Path) -> std::result::Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(config_file).format(FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

/// A relay bound to its listening socket.
pub struct Server {
    config: ServerConfig,
    relay: Arc<Relay>,
    listener: TcpListener,
}

impl Server {
    /// Opens the event log and binds the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let log = EventLog::open(&config.database_path)?;
        Self::bind_with_log(config, log).await
    }

    /// Binds a server around an already opened event log.
    pub async fn bind_with_log(config: ServerConfig, log: EventLog) -> Result<Self> {
        let address = format!("{}:{}", config.listen_address, config.listen_port);
        let listener = TcpListener::bind(&address).await.map_err(|error| {
            Error::InvalidConfig {
                message: format!("cannot listen on {}: {}", address, error),
            }
        })?;

        Ok(Self {
            config,
            relay: Arc::new(Relay::new(log)),
            listener,
        })
    }

    /// The address the server actually listens on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts clients until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        tracing::info!(address = %self.local_addr()?, "Relay listening");

        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!("Failed to accept connection: {}", error);
                    continue;
                }
            };

            // The slot is taken before the connection task exists.
            let (sender, queue) = mpsc::unbounded_channel();
            let Some(id) = self
                .relay
                .try_register(sender, self.config.max_peers as usize)
            else {
                tracing::warn!(%peer, max_peers = self.config.max_peers, "Refusing connection, peer limit reached");
                continue;
            };

            if let Err(error) = socket.set_nodelay(true) {
                tracing::debug!(%peer, "Failed to set TCP_NODELAY: {}", error);
            }
            tokio::spawn(event_loop::handle_connection(
                self.relay.clone(),
                id,
                queue,
                socket,
                peer,
            ));
        }
    }
}
