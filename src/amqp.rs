// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! Implements the transport traits on top of `lapin`. Envelope addressing maps
//! onto the AMQP `correlation_id` and `reply_to` basic properties, and envelope
//! headers travel as long-string header fields.

use crate::{
    configs::RabbitMQConfigs,
    envelope::{Delivery, Envelope, JSON_CONTENT_TYPE},
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{Channel, Connection, Connector, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens connections to RabbitMQ using the configured URI.
pub struct AmqpConnector {
    uri: String,
    host: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> AmqpConnector {
        AmqpConnector {
            uri: cfg.uri(),
            host: format!("{}:{}", cfg.host, cfg.port),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn target(&self) -> String {
        self.host.clone()
    }

    async fn open(&self) -> Result<Arc<dyn Connection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match lapin::Connection::connect(&self.uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(AmqpConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

/// A `lapin` connection.
pub struct AmqpConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError
        })
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name().as_str());
                Ok(queue.name().as_str().to_owned())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                properties(envelope),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result.map(into_delivery).map_err(|err| {
                    error!(error = err.to_string(), "errors consume msg");
                    AmqpError::ConsumerError(err.to_string())
                })
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError
            })
    }
}

fn properties(envelope: &Envelope) -> BasicProperties {
    let headers = envelope
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_headers(FieldTable::from(headers));

    if let Some(id) = &envelope.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &envelope.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    props
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let correlation_id = props.correlation_id().as_ref().map(|v| v.as_str().to_owned());
    let reply_to = props.reply_to().as_ref().map(|v| v.as_str().to_owned());
    let headers = props
        .headers()
        .as_ref()
        .map(headers_from_table)
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        envelope: Envelope {
            body: delivery.data,
            correlation_id,
            reply_to,
            headers,
        },
    }
}

fn headers_from_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok()
                .map(|value| (key.as_str().to_owned(), value.to_owned())),
            AMQPValue::ShortString(value) => Some((key.as_str().to_owned(), value.as_str().to_owned())),
            _ => None,
        })
        .collect()
}
