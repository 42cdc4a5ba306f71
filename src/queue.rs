// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder-style definitions for the two kinds of queues the RPC layer uses:
//! durable, named work queues shared by every server of one role, and
//! exclusive, auto-deleting reply queues whose name the broker assigns.

/// Work queue consumed by the weather servers.
pub const WEATHER_RPC_QUEUE: &str = "weather_rpc_queue";
/// Work queue consumed by the GIF servers.
pub const GIF_RPC_QUEUE: &str = "gif_rpc_queue";

/// Definition of a queue with its declaration flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and is not deleted
    /// when its consumers go away.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
        }
    }

    /// Creates a definition with an empty name, asking the broker to pick one.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::new("")
    }

    /// Shortcut for the queue every RPC client consumes its replies from.
    pub fn reply_queue() -> QueueDefinition {
        QueueDefinition::server_named().exclusive().delete()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }
}
