// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module implements the transport traits on top of `lapin`. It establishes
//! connections to the RabbitMQ server, creates the single channel the manager
//! works with and issues the exchange/queue declarations and bindings.

use crate::{
    configs::ConnectionParameters,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{AmqpChannel, AmqpConnection, AmqpTransport, CloseNotifier},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Transport backed by `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> LapinTransport {
        LapinTransport
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    /// Connects to the broker and registers the close notifier.
    ///
    /// `lapin` surfaces a dropped socket, a heartbeat timeout and a
    /// broker-initiated close as a connection error, so the notifier is hooked to
    /// `on_error`.
    async fn connect(
        &self,
        params: &ConnectionParameters,
        on_close: CloseNotifier,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(host = params.host_name(), "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        let conn = match Connection::connect(&params.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        conn.on_error(move |err| on_close.notify(&err.to_string()));
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, def: &QueueDefinition, exchange: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &def.name,
                exchange,
                &def.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    def.name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}
