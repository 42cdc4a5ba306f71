// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Broker Connection
//!
//! One `BrokerConnection` is built at process start and handed to every RPC
//! client and server that needs the broker. It opens the physical connection
//! lazily, keeps it for the life of the process and transparently replaces it
//! when it dies. Opening never fails from the caller's point of view: a broker
//! that is not up yet (typically a container still starting) is retried with a
//! fixed delay until it answers.

use crate::{
    amqp::AmqpConnector,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    transport::{Channel, Connection, Connector},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Delay between two connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Lazily opened, self-healing connection shared by clients and servers.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    retry_delay: Duration,
    current: Mutex<Option<Arc<dyn Connection>>>,
}

impl BrokerConnection {
    /// Creates a handle that opens connections through `connector`.
    ///
    /// Nothing is opened until the first [`connect`](Self::connect).
    ///
    /// # Parameters
    /// * `connector` - Opens physical connections, e.g. `AmqpConnector` or `MemoryBroker`
    ///
    /// # Returns
    /// A disconnected `BrokerConnection` retrying every [`DEFAULT_RETRY_DELAY`]
    pub fn new(connector: Arc<dyn Connector>) -> BrokerConnection {
        BrokerConnection {
            connector,
            retry_delay: DEFAULT_RETRY_DELAY,
            current: Mutex::new(None),
        }
    }

    /// Creates a handle to the RabbitMQ broker described by `cfg`, retrying
    /// with the configured delay.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> BrokerConnection {
        BrokerConnection::new(Arc::new(AmqpConnector::new(cfg))).with_retry_delay(cfg.retry_delay())
    }

    /// Changes the delay between two connection attempts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Returns the live connection, opening a new one if there is none.
    ///
    /// Blocks until the broker accepts a connection; failed attempts are logged
    /// and retried after the configured delay.
    pub async fn connect(&self) -> Arc<dyn Connection> {
        let mut current = self.current.lock().await;

        if let Some(conn) = current.as_ref() {
            if conn.is_connected() {
                return conn.clone();
            }
            debug!("connection lost, reconnecting");
        }

        let target = self.connector.target();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connector.open().await {
                Ok(conn) => {
                    info!(broker = target.as_str(), attempt, "connected to broker");
                    *current = Some(conn.clone());
                    return conn;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        broker = target.as_str(),
                        attempt,
                        "waiting for broker, retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Closes the connection if open. Later calls to [`connect`](Self::connect)
    /// open a new one.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        let Some(conn) = self.current.lock().await.take() else {
            return Ok(());
        };

        if conn.is_connected() {
            conn.close().await?;
            info!(broker = self.connector.target().as_str(), "disconnected from broker");
        }

        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Opens a new channel on the shared connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        self.connect().await.create_channel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_the_broker_answers() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2);
        let connection = BrokerConnection::new(Arc::new(broker.clone()));

        let started = Instant::now();
        let conn = connection.connect().await;

        assert!(conn.is_connected());
        assert_eq!(broker.connection_attempts(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_is_configurable() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(1);
        let connection = BrokerConnection::new(Arc::new(broker.clone()))
            .with_retry_delay(Duration::from_millis(250));

        let started = Instant::now();
        connection.connect().await;

        assert_eq!(broker.connection_attempts(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn configs_set_the_target_and_retry_delay() {
        let cfg = RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            connection_name: "test".to_owned(),
            retry_delay_secs: 2,
            rpc_timeout_ms: 0,
        };

        let connection = BrokerConnection::from_configs(&cfg);

        assert_eq!(connection.retry_delay, Duration::from_secs(2));
        assert_eq!(connection.connector.target(), "localhost:5672");
    }

    #[tokio::test]
    async fn connect_reuses_the_live_connection() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::new(Arc::new(broker.clone()));

        let first = connection.connect().await;
        let second = connection.connect().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn connect_replaces_a_dead_connection() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::new(Arc::new(broker.clone()));
        connection.connect().await;

        broker.drop_connections().await;
        assert!(!connection.is_connected().await);

        let conn = connection.connect().await;
        assert!(conn.is_connected());
        assert_eq!(broker.connection_attempts(), 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = BrokerConnection::new(Arc::new(broker.clone()));
        let conn = connection.connect().await;

        connection.disconnect().await.unwrap();
        connection.disconnect().await.unwrap();

        assert!(!conn.is_connected());
        assert!(!connection.is_connected().await);

        connection.connect().await;
        assert_eq!(broker.connection_attempts(), 2);
    }
}
