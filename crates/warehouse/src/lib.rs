//! Warehouse storage backends for the materializer.

pub mod clickhouse;
pub mod config;
pub mod ident;
pub mod memory;
pub mod postgres;
pub mod store;

use std::sync::Arc;

use materializer_core::Result;

pub use self::clickhouse::ClickHouseWarehouse;
pub use self::config::*;
pub use self::memory::MemoryWarehouse;
pub use self::postgres::PostgresWarehouse;
pub use self::store::*;

/// Connects to the configured backend.
pub async fn connect(config: &WarehouseConfig) -> Result<Arc<dyn Warehouse>> {
    let warehouse: Arc<dyn Warehouse> = match config.backend {
        Backend::Clickhouse => Arc::new(ClickHouseWarehouse::new(config.clone())?),
        Backend::Postgres => Arc::new(PostgresWarehouse::connect(config).await?),
        Backend::Memory => Arc::new(MemoryWarehouse::new()),
    };
    Ok(warehouse)
}
