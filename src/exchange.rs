// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The manager declares exactly one exchange per connection. Its kind is fixed
//! to topic so that queues can subscribe with routing key patterns.

/// Definition of the topic exchange declared on every setup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition with the given name.
    pub fn topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
