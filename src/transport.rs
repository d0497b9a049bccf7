// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The connection manager never talks to a socket directly. It drives the
//! broker through the three traits in this module: a transport that opens
//! connections, a connection that opens channels and a channel that declares
//! and binds topology. Each call resolves once the broker acknowledges it.
//!
//! Unexpected closes travel the other way, through the [`CloseNotifier`]
//! handed to [`AmqpTransport::connect`].

use crate::{
    configs::ConnectionParameters, errors::AmqpError, exchange::ExchangeDefinition,
    manager::Event, queue::QueueDefinition,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Opens a connection described by `params`.
    ///
    /// Implementations must wire `on_close` to the connection before returning
    /// it, so that a close racing with the handshake is never lost.
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_close: CloseNotifier,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection. Must not fire the close notifier.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel opened on an [`AmqpConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds `def` to `exchange` using the definition's routing key.
    async fn bind_queue(&self, def: &QueueDefinition, exchange: &str) -> Result<(), AmqpError>;
}

/// Reports an unexpected connection close back to the manager that opened it.
///
/// Notifications from a connection the manager already gave up on are
/// discarded, so it is safe to fire this more than once or late.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    cycle: u64,
    events: UnboundedSender<Event>,
}

impl CloseNotifier {
    pub(crate) fn new(cycle: u64, events: UnboundedSender<Event>) -> CloseNotifier {
        CloseNotifier { cycle, events }
    }

    pub fn notify(&self, reason: &str) {
        // the manager may already be gone
        let _ = self.events.send(Event::ConnectionClosed {
            cycle: self.cycle,
            reason: reason.to_owned(),
        });
    }
}
