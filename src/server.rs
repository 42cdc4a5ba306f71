// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Consumes a durable work queue and answers every request through a
//! [`RequestHandler`].
//!
//! The channel runs with a prefetch count of one: a server holds a single
//! unacknowledged request at a time, which spreads work fairly across all
//! servers sharing the queue.
//!
//! Every delivery is acknowledged once handling is over, whatever the outcome.
//! Requests whose handling fails are logged and dropped without a reply
//! (at-most-once processing); the caller's deadline turns that silence into a
//! timeout.

use crate::{
    connection::BrokerConnection,
    envelope::{Delivery, Envelope},
    errors::AmqpError,
    handler::RequestHandler,
    otel,
    queue::QueueDefinition,
    transport::{Channel, DEFAULT_EXCHANGE},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Unacknowledged deliveries a server may hold.
pub const RPC_PREFETCH_COUNT: u16 = 1;

/// Server side of the RPC protocol: one channel consuming one work queue.
///
/// Several servers may consume the same queue; the broker spreads requests
/// across them.
pub struct RpcServer<H: RequestHandler> {
    channel: Arc<dyn Channel>,
    queue_name: String,
    handler: Arc<H>,
}

impl<H: RequestHandler> RpcServer<H> {
    /// Opens a channel, declares the durable work queue `queue_name` and sets
    /// the prefetch window.
    pub async fn new(
        connection: &BrokerConnection,
        queue_name: &str,
        handler: Arc<H>,
    ) -> Result<RpcServer<H>, AmqpError> {
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(&QueueDefinition::new(queue_name).durable())
            .await?;
        channel.basic_qos(RPC_PREFETCH_COUNT).await?;

        info!(queue = queue_name, "rpc server ready");

        Ok(RpcServer {
            channel,
            queue_name: queue_name.to_owned(),
            handler,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Consumes requests until the channel closes.
    pub async fn consume(&self) -> Result<(), AmqpError> {
        let consumer_tag = format!("rpc-server-{}", Uuid::new_v4());
        let mut deliveries = self
            .channel
            .basic_consume(&self.queue_name, &consumer_tag, false)
            .await?;

        info!(queue = self.queue_name.as_str(), "waiting for requests");
        let tracer = global::tracer("rpc server");

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = self.handle(&tracer, delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        info!(queue = self.queue_name.as_str(), "rpc server stopped");
        Ok(())
    }

    /// Answers one delivery, then acknowledges it.
    async fn handle(&self, tracer: &BoxedTracer, delivery: Delivery) -> Result<(), AmqpError> {
        let mut span = otel::new_span(&delivery.envelope, tracer, &self.queue_name);

        debug!(
            queue = self.queue_name.as_str(),
            correlation_id = delivery.envelope.correlation_id.as_deref().unwrap_or_default(),
            "received request"
        );

        match self.reply(&delivery.envelope).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue_name.as_str(),
                    "failure to process request, no reply sent"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        if let Err(err) = self.channel.basic_ack(delivery.delivery_tag).await {
            error!("error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            return Err(err);
        }

        Ok(())
    }

    async fn reply(&self, request: &Envelope) -> Result<(), AmqpError> {
        let payload: H::Request = request.decode()?;

        let Some(reply_to) = request.reply_to.as_deref() else {
            return Err(AmqpError::MissingReplyTo);
        };
        let Some(correlation_id) = request.correlation_id.as_deref() else {
            return Err(AmqpError::MissingCorrelationId);
        };

        let response = self.handler.process(payload).await?;

        let reply = Envelope::reply(&response, correlation_id)?;
        self.channel
            .basic_publish(DEFAULT_EXCHANGE, reply_to, &reply)
            .await?;

        debug!(reply_to, correlation_id, "reply sent");
        Ok(())
    }
}
