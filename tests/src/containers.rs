//! Testcontainer setup for ClickHouse.

use std::time::Duration;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use warehouse::{Backend, WarehouseConfig};

/// Container handle for ClickHouse.
pub struct TestContainers {
    #[allow(dead_code)]
    clickhouse: Option<ContainerAsync<GenericImage>>,
    pub warehouse: WarehouseConfig,
}

impl TestContainers {
    /// Start ClickHouse, or reuse the server named by `MATERIALIZER_TEST_CLICKHOUSE_HOST`.
    pub async fn start() -> Self {
        if let Some(host) = std::env::var("MATERIALIZER_TEST_CLICKHOUSE_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            let port = std::env::var("MATERIALIZER_TEST_CLICKHOUSE_PORT")
                .ok()
                .and_then(|p| p.parse().ok());
            return Self {
                clickhouse: None,
                warehouse: WarehouseConfig {
                    backend: Backend::Clickhouse,
                    host,
                    port,
                    username: std::env::var("MATERIALIZER_TEST_CLICKHOUSE_USER").ok(),
                    password: std::env::var("MATERIALIZER_TEST_CLICKHOUSE_PASSWORD").ok(),
                    ..WarehouseConfig::default()
                },
            };
        }

        let (clickhouse, port) = start_clickhouse().await;

        Self {
            clickhouse: Some(clickhouse),
            warehouse: WarehouseConfig {
                backend: Backend::Clickhouse,
                host: "127.0.0.1".to_string(),
                port: Some(port),
                database: "default".to_string(),
                username: Some("default".to_string()),
                // Small batches so multi-chunk inserts are exercised
                insert_batch_rows: 2,
                ..WarehouseConfig::default()
            },
        }
    }
}

/// Start ClickHouse container, return container and mapped HTTP port.
pub async fn start_clickhouse() -> (ContainerAsync<GenericImage>, u16) {
    // CLICKHOUSE_DEFAULT_ACCESS_MANAGEMENT=1 lets the default user create roles and grant
    let image = GenericImage::new("clickhouse/clickhouse-server", "24.3")
        .with_wait_for(WaitFor::seconds(5))
        .with_exposed_port(8123.tcp())
        .with_env_var("CLICKHOUSE_DEFAULT_ACCESS_MANAGEMENT", "1")
        .with_env_var("CLICKHOUSE_USER", "default")
        .with_env_var("CLICKHOUSE_PASSWORD", "");

    let container = image.start().await.expect("Failed to start ClickHouse");

    let port = container.get_host_port_ipv4(8123).await.unwrap();
    let url = format!("http://127.0.0.1:{}", port);

    // Wait for HTTP endpoint to be ready
    wait_for_http(&url, Duration::from_secs(30)).await;

    (container, port)
}

/// Wait for HTTP endpoint to respond.
async fn wait_for_http(url: &str, timeout: Duration) {
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if let Ok(resp) = client.get(format!("{}/ping", url)).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("HTTP endpoint {} not ready after {:?}", url, timeout);
}
