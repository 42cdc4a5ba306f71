// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The RPC client and server only need a handful of AMQP primitives: declare a
//! queue, set the prefetch window, publish, consume and acknowledge. These
//! traits describe exactly that surface so the protocol can run over RabbitMQ
//! (see [`crate::amqp`]) or over the in-process broker in [`crate::memory`].

use crate::{
    envelope::{Delivery, Envelope},
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries produced by [`Channel::basic_consume`].
///
/// The stream ends when the channel or its connection is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens physical connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human readable address of the broker, used in logs.
    fn target(&self) -> String;

    /// Makes a single attempt to open a connection.
    async fn open(&self) -> Result<Arc<dyn Connection>, AmqpError>;
}

/// A live link to the broker, multiplexing any number of channels.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical session owned by a single client or server.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares a queue and returns its name, which the broker picks when the
    /// definition is server named.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Limits the number of unacknowledged deliveries held by this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer. With `no_ack` every delivery counts as handled as
    /// soon as it is sent.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
