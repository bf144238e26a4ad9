use crate::errors::{Error, Result};
use clap::{Args, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Sensor ingest server
#[derive(Debug, Clone, Parser)]
#[command(name = "ingestor", version)]
pub struct Config {
    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub storage: StorageConfig,

    #[command(flatten)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Host the ingest listener binds to
    #[arg(long, env = "INGEST_HOST", default_value = "localhost")]
    pub host: String,

    /// Port the ingest listener binds to
    #[arg(long, env = "INGEST_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Size of the single receive buffer; longer requests are truncated
    #[arg(long, env = "RECV_BUFFER_SIZE", default_value_t = 1024)]
    pub buffer_size: usize,

    /// Listen backlog
    #[arg(long, env = "MAX_PENDING_CONNECTIONS", default_value_t = 5)]
    pub max_pending: u32,

    /// Maximum connections handled at the same time
    #[arg(long, env = "MAX_ACTIVE_CONNECTIONS", default_value_t = 256)]
    pub max_active: usize,

    #[arg(long, env = "READ_TIMEOUT_MS", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    #[arg(long, env = "WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct StorageConfig {
    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "data/sensor_data.db")]
    pub database_path: PathBuf,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 8)]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Args)]
pub struct ApiConfig {
    /// Address of the read-only HTTP API
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:5000")]
    pub http_addr: SocketAddr,

    /// Seconds between device rollup refreshes
    #[arg(long, env = "ROLLUP_INTERVAL_SECS", default_value_t = 5)]
    pub rollup_interval_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        if self.storage.max_connections == 0 {
            return Err(Error::Config("db max connections must be at least 1".to_string()));
        }
        if self.api.rollup_interval_secs == 0 {
            return Err(Error::Config("rollup interval must be at least 1 second".to_string()));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("receive buffer size must be non-zero".to_string()));
        }
        if self.max_active == 0 {
            return Err(Error::Config("max active connections must be at least 1".to_string()));
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(Error::Config("socket timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            buffer_size: 1024,
            max_pending: 5,
            max_active: 256,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}
