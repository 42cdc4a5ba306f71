// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker RPC Layer
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker:
//! connection and channel setup, queue declaration, publishing, consuming,
//! acknowledging and waiting for correlated replies. `HandlerError` is what a
//! request handler reports back to the server loop.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry just enough context to identify the failed operation; the
/// underlying transport error is logged where it happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A request arrived without a reply-to address
    #[error("request without reply_to")]
    MissingReplyTo,

    /// A request arrived without a correlation id
    #[error("request without correlation_id")]
    MissingCorrelationId,

    /// The request handler failed to process a message
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// No correlated reply arrived before the deadline
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The reply consumer stopped while a call was pending
    #[error("reply channel closed")]
    ReplyChannelClosed,
}

/// Errors reported by a [`RequestHandler`](crate::handler::RequestHandler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The third-party service behind the handler failed
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<HandlerError> for AmqpError {
    fn from(err: HandlerError) -> Self {
        AmqpError::HandlerError(err.to_string())
    }
}
