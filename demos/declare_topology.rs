// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Declares a single queue on a local broker and keeps it declared until Ctrl-C.
//!
//! ```text
//! RUST_LOG=debug cargo run --example declare_topology
//! ```

use rabbitmq_connection::{
    channel::LapinTransport, configs::ConnectionParameters, errors::AmqpError,
    manager::ConnectionManager, queue::QueueDefinition,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .init();

    let handle = ConnectionManager::new(
        ConnectionParameters::new("localhost"),
        Arc::new(LapinTransport::new()),
    )
    .add_queue_definition(QueueDefinition::new("test", "test.route"))
    .start();

    let mut status = handle.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = status.borrow_and_update().state;
            info!(?state, "connection status changed");
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for ctrl-c");
    }

    info!("shutting down");
    handle.close().await
}
