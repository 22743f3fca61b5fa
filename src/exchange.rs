// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Direct exchange declarations, active or passive.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
}

impl ExchangeDefinition {
    /// A transient direct exchange; chain [`durable`](Self::durable) for the
    /// Settix exchange.
    pub fn direct(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
            auto_delete: false,
            passive: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Turns the declaration into an existence check. A passive declare of a
    /// missing exchange fails and closes the channel it ran on.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// The existence check matching this definition.
    pub fn as_passive(&self) -> Self {
        self.clone().passive()
    }
}
