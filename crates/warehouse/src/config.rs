//! Warehouse connection configuration.

use serde::{Deserialize, Serialize};

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Clickhouse,
    Postgres,
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clickhouse => "clickhouse",
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Self::Clickhouse => 8123,
            Self::Postgres => 5432,
            Self::Memory => 0,
        }
    }
}

/// Warehouse client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the backend's standard port
    pub port: Option<u16>,
    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
    /// Use https for ClickHouse, require TLS for PostgreSQL
    #[serde(default)]
    pub tls: bool,
    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Connect/acquire timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Rows per insert statement
    #[serde(default = "default_insert_batch_rows")]
    pub insert_batch_rows: usize,
}

fn default_backend() -> Backend {
    Backend::Clickhouse
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_database() -> String {
    "analytics".to_string()
}

fn default_pool_size() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_insert_batch_rows() -> usize {
    10_000
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_host(),
            port: None,
            database: default_database(),
            username: None,
            password: None,
            tls: false,
            pool_size: default_pool_size(),
            timeout_secs: default_timeout_secs(),
            insert_batch_rows: default_insert_batch_rows(),
        }
    }
}

impl WarehouseConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    /// ClickHouse HTTP URL.
    pub fn http_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port())
    }

    /// Rows per insert, never zero.
    pub fn batch_rows(&self) -> usize {
        self.insert_batch_rows.max(1)
    }
}
