// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Connection Manager
//!
//! This module provides the error type reported by every stage of the
//! connection setup. The `AmqpError` enum tags each failure with the stage that
//! produced it, so a rejected exchange declare can be told apart from a refused
//! TCP connection even though both end up on the same reconnect path.

use thiserror::Error;

/// Represents errors that can occur while establishing the connection topology.
///
/// Each variant maps to one stage of the setup sequence: connecting, opening the
/// channel, declaring the exchange, declaring a queue and binding it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error closing the connection
    #[error("failure to close the connection `{0}`")]
    CloseError(String),

    /// The manager was shut down before the requested condition was reached
    #[error("connection manager closed")]
    ManagerClosed,
}

impl AmqpError {
    /// Name of the setup stage that produced the error, used as a log field.
    pub fn stage(&self) -> &'static str {
        match self {
            AmqpError::InternalError => "internal",
            AmqpError::ConnectionError(_) => "connect",
            AmqpError::ChannelError(_) => "channel",
            AmqpError::DeclareExchangeError(_) => "exchange",
            AmqpError::DeclareQueueError(_) => "queue_declare",
            AmqpError::BindingExchangeToQueueError(_, _) => "queue_bind",
            AmqpError::CloseError(_) => "close",
            AmqpError::ManagerClosed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_error_names_exchange_and_queue() {
        let err = AmqpError::BindingExchangeToQueueError("orders".into(), "billing".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `orders` to queue `billing`"
        );
        assert_eq!(err.stage(), "queue_bind");
    }

    #[test]
    fn stage_names_are_distinct_per_setup_step() {
        assert_eq!(AmqpError::ConnectionError("".into()).stage(), "connect");
        assert_eq!(AmqpError::ChannelError("".into()).stage(), "channel");
        assert_eq!(AmqpError::DeclareExchangeError("".into()).stage(), "exchange");
        assert_eq!(AmqpError::DeclareQueueError("".into()).stage(), "queue_declare");
    }
}
