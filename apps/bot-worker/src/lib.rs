//! Bot worker service
//!
//! Consumes chat messages from NATS JetStream and answers them.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (stream owning consumer.subject)
//!   ↓ (durable pull consumer: consumer.consumer_name)
//! NatsConsumer × concurrency workers
//!   ↓ (optional reply_filter)
//! ReplyHandler
//!   ↓ (NatsProducer, producer.subject)
//! Chat gateway
//! ```
//!
//! ## Features
//!
//! - YAML configuration validated before connecting
//! - Explicit ack/nak/term per message
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Health check endpoints for Kubernetes liveness and readiness
//! - Prometheus metrics

pub mod config;
pub mod handler;
pub mod health;

pub use config::{AppConfig, Cli};

use core_config::Environment;
use eyre::{Result, WrapErr};
use health::HealthServer;
use nats_consumer::{NatsConsumer, NatsProducer, Publisher};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Run the bot worker
///
/// 1. Loads and validates the YAML configuration
/// 2. Sets up structured logging and metrics
/// 3. Connects the reply producer and starts the consumer
/// 4. Waits for SIGINT/SIGTERM, then closes the consumer and the producer
///
/// # Errors
///
/// Returns an error if the configuration is invalid, or if NATS is
/// unreachable at startup.
pub async fn run(cli: Cli) -> Result<()> {
    core_config::tracing::install_color_eyre();

    let config_path = cli.config_path();
    let config = AppConfig::load(&config_path)
        .wrap_err_with(|| format!("Failed to load config from {}", config_path.display()))?;

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment, &config.logger.level);

    let metrics_handle = health::init_metrics()?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting bot worker"
    );
    info!(
        config = %config_path.display(),
        subject = %config.consumer.subject,
        consumer = %config.consumer.consumer_name,
        concurrency = config.consumer.concurrency,
        "Configuration loaded"
    );

    let health_server = HealthServer::new(config.health_port).with_metrics(metrics_handle);
    let health = health_server.state();
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut consumer =
        NatsConsumer::nats(config.consumer.clone()).wrap_err("Invalid consumer configuration")?;

    let producer = match &config.producer {
        Some(producer_config) => {
            let producer = NatsProducer::connect(producer_config)
                .await
                .wrap_err_with(|| format!("Failed to connect producer to {}", producer_config.nats_url))?;
            info!(subject = %producer.subject(), "Reply producer connected");
            Some(producer)
        }
        None => {
            warn!("No producer configured, messages will not be answered");
            None
        }
    };

    let reply_subject = producer
        .as_ref()
        .map(|p| p.subject().to_string())
        .unwrap_or_default();
    let publisher = producer
        .clone()
        .map(|p| Arc::new(p) as Arc<dyn Publisher>);
    let handler = handler::build(
        config.reply_filter.as_ref(),
        publisher,
        &reply_subject,
        &config.reply_prefix,
    )?;
    consumer.set_handler(handler).await;

    if let Err(e) = consumer.start().await {
        health.set_error(Some(e.to_string())).await;
        return Err(eyre::Report::new(e).wrap_err("Failed to start NATS consumer"));
    }
    health.set_consumer_running(true).await;

    shutdown_signal().await;

    health.set_consumer_running(false).await;
    consumer.close().await;

    if let Some(mut producer) = producer {
        if let Err(e) = producer.close().await {
            warn!(error = %e, "Failed to close reply producer");
        }
    }

    info!("Bot worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
