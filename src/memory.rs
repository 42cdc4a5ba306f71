// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living inside the process, implementing the part of AMQP the RPC
//! protocol relies on:
//!
//! - routing through the default exchange by queue name, dropping unroutable messages
//! - server-named, exclusive and auto-delete queues
//! - per-channel prefetch windows with manual or automatic acknowledgement
//! - round-robin dispatch between consumers of one queue
//! - requeue of unacknowledged deliveries when a channel closes
//!
//! Every publish, delivery and ack is recorded in a journal that tests use to
//! check ordering guarantees.

use crate::{
    envelope::{Delivery, Envelope},
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{Channel, Connection, Connector, DeliveryStream, DEFAULT_EXCHANGE},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Something observable that happened inside the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Published {
        queue: String,
        correlation_id: Option<String>,
    },
    Delivered {
        queue: String,
        delivery_tag: u64,
    },
    Acked {
        queue: String,
        delivery_tag: u64,
    },
    /// A message was published to a queue that does not exist.
    Unroutable { routing_key: String },
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    auto_delete: bool,
    owner: Option<u64>,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, Envelope)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    next_id: u64,
    next_delivery_tag: u64,
    journal: Vec<BrokerEvent>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn declare(&mut self, connection_id: u64, def: &QueueDefinition) -> Result<String, AmqpError> {
        let name = if def.is_server_named() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        match self.queues.get(&name) {
            Some(queue) => {
                if queue.owner.is_some_and(|owner| owner != connection_id) {
                    warn!(queue = name.as_str(), "queue is exclusive to another connection");
                    return Err(AmqpError::DeclareQueueError(name));
                }
                if queue.durable != def.durable {
                    warn!(queue = name.as_str(), "queue already declared with different flags");
                    return Err(AmqpError::DeclareQueueError(name));
                }
            }
            None => {
                self.queues.insert(
                    name.clone(),
                    QueueState {
                        durable: def.durable,
                        auto_delete: def.delete,
                        owner: def.exclusive.then_some(connection_id),
                        ..QueueState::default()
                    },
                );
            }
        }

        Ok(name)
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), AmqpError> {
        if exchange != DEFAULT_EXCHANGE {
            warn!(exchange, "only the default exchange is supported");
            return Err(AmqpError::PublishingError);
        }

        let Some(queue) = self.queues.get_mut(routing_key) else {
            debug!(routing_key, "dropping unroutable message");
            self.journal.push(BrokerEvent::Unroutable {
                routing_key: routing_key.to_owned(),
            });
            return Ok(());
        };

        queue.ready.push_back(envelope.clone());
        self.journal.push(BrokerEvent::Published {
            queue: routing_key.to_owned(),
            correlation_id: envelope.correlation_id.clone(),
        });
        self.dispatch(routing_key);
        Ok(())
    }

    /// Hands ready messages to consumers while some consumer has room for them.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues,
            channels,
            next_delivery_tag,
            journal,
            ..
        } = self;

        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    consumer.no_ack
                        || channels
                            .get(&consumer.channel_id)
                            .is_some_and(ChannelState::has_capacity)
                });

            let Some(idx) = chosen else {
                return;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                return;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let consumer = &queue.consumers[idx];

            if !consumer.no_ack {
                if let Some(channel) = channels.get_mut(&consumer.channel_id) {
                    channel
                        .unacked
                        .insert(delivery_tag, (name.to_owned(), envelope.clone()));
                }
            }

            let delivery = Delivery {
                delivery_tag,
                envelope,
            };

            match consumer.sender.send(Ok(delivery)) {
                Ok(()) => {
                    journal.push(BrokerEvent::Delivered {
                        queue: name.to_owned(),
                        delivery_tag,
                    });
                    queue.cursor = (idx + 1) % count;
                }
                Err(mpsc::error::SendError(returned)) => {
                    debug!(consumer = consumer.tag.as_str(), "consumer went away, requeuing");
                    if let Some(channel) = channels.get_mut(&consumer.channel_id) {
                        channel.unacked.remove(&delivery_tag);
                    }
                    if let Ok(delivery) = returned {
                        queue.ready.push_front(delivery.envelope);
                    }
                    queue.consumers.remove(idx);
                    queue.cursor = 0;
                }
            }
        }
    }

    fn ack(&mut self, channel_id: u64, delivery_tag: u64) -> Result<(), AmqpError> {
        let Some((queue, _)) = self
            .channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag))
        else {
            warn!(delivery_tag, "unknown delivery tag");
            return Err(AmqpError::AckMessageError);
        };

        self.journal.push(BrokerEvent::Acked {
            queue: queue.clone(),
            delivery_tag,
        });
        self.dispatch(&queue);
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel_id != channel_id);
            if queue.consumers.len() != before {
                queue.cursor = 0;
                touched.push((name.clone(), true));
            }
        }

        // Unacked deliveries go back to the head of their queue, oldest first.
        for (_, (name, envelope)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_front(envelope);
                touched.push((name, false));
            }
        }

        for (name, lost_consumer) in touched {
            let delete = self
                .queues
                .get(&name)
                .is_some_and(|q| lost_consumer && q.auto_delete && q.consumers.is_empty());
            if delete {
                debug!(queue = name.as_str(), "auto-deleting queue");
                self.queues.remove(&name);
            } else {
                self.dispatch(&name);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(alive) = self.connections.remove(&connection_id) {
            alive.store(false, Ordering::SeqCst);
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }

        self.queues
            .retain(|_, queue| queue.owner != Some(connection_id));
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Refuses the next `count` connection attempts, as an unreachable broker would.
    pub fn refuse_connections(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far, refused ones included.
    pub fn connection_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Closes every open connection from the broker side.
    pub async fn drop_connections(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Deletes `name` from the broker side. Its consumers are cancelled and
    /// their delivery streams end while their channels stay open.
    pub async fn delete_queue(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.remove(name) {
            debug!(
                queue = name,
                consumers = queue.consumers.len(),
                "queue deleted, cancelling consumers"
            );
        }
    }

    pub async fn journal(&self) -> Vec<BrokerEvent> {
        self.state.lock().await.journal.clone()
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    /// Number of messages waiting in `name` that no consumer holds yet.
    pub async fn ready_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map_or(0, |queue| queue.ready.len())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    fn target(&self) -> String {
        "memory".to_owned()
    }

    async fn open(&self) -> Result<Arc<dyn Connection>, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::ConnectionError);
        }

        let alive = Arc::new(AtomicBool::new(true));
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.connections.insert(id, alive.clone());

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
            alive,
        }))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError);
        }

        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                unacked: BTreeMap::default(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
            connection_id: self.id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().await.close_connection(self.id);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
    connection_id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), AmqpError> {
        match state.channels.contains_key(&self.id) {
            true => Ok(()),
            false => Err(AmqpError::ChannelError),
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        state.declare(self.connection_id, def)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = prefetch_count;
                Ok(())
            }
            None => Err(AmqpError::QoSDeclarationError("channel closed".to_owned())),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        state.publish(exchange, routing_key, envelope)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        if target.owner.is_some_and(|owner| owner != self.connection_id) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            no_ack,
            sender,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state.lock().await.ack(self.id, delivery_tag)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().await.close_channel(self.id);
        Ok(())
    }
}
