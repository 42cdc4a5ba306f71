// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Publishes requests onto a work queue and waits for the correlated reply.
//!
//! Each client owns a channel and an exclusive, broker-named reply queue that
//! it consumes with automatic acknowledgement. A background task watches the
//! reply queue and resolves the pending call when a reply carrying its
//! correlation id shows up; any other reply is stale and gets discarded.
//!
//! A client has a single pending-call slot, so calls on one instance are
//! serialized. Create more clients for parallel calls.

use crate::{
    configs::RabbitMQConfigs,
    connection::BrokerConnection,
    envelope::{CorrelationId, Envelope},
    errors::AmqpError,
    otel,
    queue::QueueDefinition,
    transport::{Channel, DeliveryStream, DEFAULT_EXCHANGE},
};
use futures_util::StreamExt;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default deadline for a single call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    /// How long a call waits for its reply; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        RpcClientConfig {
            timeout: Some(DEFAULT_RPC_TIMEOUT),
        }
    }
}

impl From<&RabbitMQConfigs> for RpcClientConfig {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        RpcClientConfig {
            timeout: cfg.rpc_timeout(),
        }
    }
}

/// The call currently waiting for a reply.
struct PendingCall {
    correlation_id: CorrelationId,
    responder: oneshot::Sender<Envelope>,
}

/// State shared between callers and the reply listener.
#[derive(Default)]
struct ReplySlot {
    call: Option<PendingCall>,
    /// Set once the reply stream has ended; no reply can arrive after that.
    closed: bool,
}

type PendingSlot = Arc<Mutex<ReplySlot>>;

/// Client side of the RPC protocol, bound to one channel and one reply queue.
///
/// Dropping the client stops its reply listener; [`close`](Self::close) also
/// closes the channel.
pub struct RpcClient {
    channel: Arc<dyn Channel>,
    reply_queue: String,
    pending: PendingSlot,
    in_flight: Mutex<()>,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Opens a channel on `connection`, declares the reply queue and starts
    /// consuming it.
    pub async fn new(
        connection: &BrokerConnection,
        config: RpcClientConfig,
    ) -> Result<RpcClient, AmqpError> {
        let channel = connection.create_channel().await?;
        let reply_queue = channel.queue_declare(&QueueDefinition::reply_queue()).await?;

        let consumer_tag = format!("rpc-client-{}", Uuid::new_v4());
        let deliveries = channel.basic_consume(&reply_queue, &consumer_tag, true).await?;

        let pending = PendingSlot::default();
        let listener = tokio::spawn(listen_for_replies(deliveries, pending.clone()));

        debug!(reply_queue = reply_queue.as_str(), "rpc client ready");

        Ok(RpcClient {
            channel,
            reply_queue,
            pending,
            in_flight: Mutex::new(()),
            timeout: config.timeout,
            listener,
        })
    }

    /// Name the broker gave to this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Sends `payload` to `queue_name` and waits for the correlated reply.
    ///
    /// Resolves to [`AmqpError::Timeout`] when no reply arrives within the
    /// configured deadline, and to [`AmqpError::ReplyChannelClosed`] once the
    /// reply consumer has stopped.
    pub async fn send_request<Req, Res>(&self, payload: &Req, queue_name: &str) -> Result<Res, AmqpError>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let _turn = self.in_flight.lock().await;

        let correlation_id = CorrelationId::new();
        let mut envelope = Envelope::request(payload, &correlation_id, &self.reply_queue)?;
        otel::inject(&Context::current(), &mut envelope.headers);

        let (responder, reply) = oneshot::channel();
        {
            let mut slot = self.pending.lock().await;
            if slot.closed {
                warn!(
                    reply_queue = self.reply_queue.as_str(),
                    "reply consumer stopped, not sending request"
                );
                return Err(AmqpError::ReplyChannelClosed);
            }
            slot.call = Some(PendingCall {
                correlation_id: correlation_id.clone(),
                responder,
            });
        }

        debug!(
            queue = queue_name,
            correlation_id = correlation_id.as_str(),
            "sending rpc request"
        );

        if let Err(err) = self
            .channel
            .basic_publish(DEFAULT_EXCHANGE, queue_name, &envelope)
            .await
        {
            self.pending.lock().await.call.take();
            return Err(err);
        }

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.call.take();
                    warn!(
                        queue = queue_name,
                        correlation_id = correlation_id.as_str(),
                        "rpc request timed out after {:?}",
                        limit
                    );
                    return Err(AmqpError::Timeout(limit));
                }
            },
            None => reply.await,
        };

        match reply {
            Ok(envelope) => envelope.decode(),
            Err(_) => Err(AmqpError::ReplyChannelClosed),
        }
    }

    /// Stops consuming replies and closes the channel, which lets the broker
    /// drop the reply queue.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.listener.abort();
        self.channel.close().await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_for_replies(mut deliveries: DeliveryStream, pending: PendingSlot) {
    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                on_reply(delivery.envelope, &pending).await;
            }
            Err(err) => error!(error = err.to_string(), "errors consume reply"),
        }
    }

    debug!("reply consumer stopped");
    // Wakes a waiting call with `ReplyChannelClosed` and fails later ones early.
    let mut slot = pending.lock().await;
    slot.closed = true;
    slot.call.take();
}

/// Resolves the pending call if `envelope` answers it. Returns whether it did.
async fn on_reply(envelope: Envelope, pending: &Mutex<ReplySlot>) -> bool {
    let mut slot = pending.lock().await;

    let awaited = slot
        .call
        .as_ref()
        .is_some_and(|call| envelope.correlates_with(&call.correlation_id));
    if !awaited {
        debug!(
            correlation_id = envelope.correlation_id.as_deref().unwrap_or_default(),
            "discarding stale reply"
        );
        return false;
    }

    if let Some(call) = slot.call.take() {
        if call.responder.send(envelope).is_err() {
            debug!("caller stopped waiting for the reply");
        }
    }

    true
}
