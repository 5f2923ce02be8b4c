//! natsq demo
//!
//! Subscribes to `orders`, publishes a good and a bad order, and shows the
//! bad one being recovered from and naked while the good one is acked.

use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use natsq::{Context, InitOptions, LogHandler, MetricsHandler, Worker, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOPIC: &str = "orders";

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    #[serde(default)]
    bad: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus recorder")?;

    let config = WorkerConfig::from_env()?;
    info!(config = ?config, "Starting natsq demo");

    let worker = Worker::with_options(
        config,
        InitOptions::new().with_handler(Arc::new(MetricsHandler::new(LogHandler))),
    )?;

    worker
        .subscribe(TOPIC, |ctx, topic, payload| async move {
            let order: Order = match serde_json::from_slice(&payload) {
                Ok(order) => order,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping malformed order");
                    return true;
                }
            };

            if order.bad {
                panic!("order {} is bad", order.id);
            }

            info!(
                topic = %topic,
                publish_id = ?ctx.publish_id(),
                order_id = order.id,
                "Order processed"
            );
            true
        })
        .await
        .wrap_err("Failed to subscribe to orders")?;

    let orders = [Order { id: 1, bad: false }, Order { id: 2, bad: true }];
    for order in &orders {
        let ctx = Context::new().with_request_id(format!("order-{}", order.id));
        worker
            .publish(&ctx, TOPIC, order)
            .await
            .wrap_err_with(|| format!("Failed to publish order {}", order.id))?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    worker.close().await;
    debug!(metrics = %metrics.render(), "Final metrics");
    info!("natsq demo finished");

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let is_prod = std::env::var("ENVIRONMENT")
        .map(|e| e == "production")
        .unwrap_or(false);

    if is_prod {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}
