// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A queue definition names a queue and the routing key it is bound with on the
//! manager's exchange. Definitions are registered on the manager before it is
//! started and replayed on every reconnect.

/// Definition of a RabbitMQ queue and its binding.
///
/// This struct implements the builder pattern for the declare flags. All flags
/// default to false, which yields a plain, non-durable, shared queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) routing_key: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and routing key.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    /// * `routing_key` - The routing key (or topic pattern) used to bind the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str, routing_key: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            routing_key: routing_key.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes and recreated
    /// by the next setup pass.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}
