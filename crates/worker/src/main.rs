//! `sporty-worker` -- Groups service event consumer.
//!
//! Connects to the AMQP broker named by `EVENT_BUS_CONNECTION`, subscribes
//! the Groups handlers and keeps consuming until SIGINT/SIGTERM.
//!
//! # Environment variables
//!
//! | Variable                       | Required | Default     |
//! |--------------------------------|----------|-------------|
//! | `SERVICE_NAME`                 | yes      | --          |
//! | `EVENT_BUS_CONNECTION`         | no       | `localhost` |
//! | `EVENT_BUS_USERNAME`           | no       | --          |
//! | `EVENT_BUS_PASSWORD`           | no       | --          |
//! | `EVENT_BUS_RETRY_COUNT`        | no       | `5`         |
//! | `EVENT_BUS_RETRY_DELAY_MS`     | no       | `2000`      |
//! | `EVENT_BUS_RETRY_MAX_DELAY_MS` | no       | `60000`     |

use std::sync::Arc;

use sporty_events::{AmqpBroker, Broker, EventBusConfig};
use sporty_worker::members::MemberStore;
use sporty_worker::service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sporty_worker=debug,sporty_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EventBusConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid event bus configuration");
        std::process::exit(1);
    });
    tracing::info!(%config, "Starting sporty-worker");

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::with_connection_name(
        config.service_name.clone(),
    ));
    let members = Arc::new(MemberStore::new());

    let groups =
        match service::start_groups_service(broker, &config, Arc::clone(&members))
            .await
        {
            Ok(bus) => bus,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start Groups service");
                std::process::exit(1);
            }
        };

    shutdown_signal().await;

    // --- Shutdown ---
    groups.shutdown().await;

    tracing::info!(members = members.len().await, "Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
