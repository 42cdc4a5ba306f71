// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings for RabbitMQ, read from `RABBITMQ_*` environment
//! variables on top of built-in defaults. For example `RABBITMQ_HOST=localhost`
//! or `RABBITMQ_RPC_TIMEOUT_MS=0` (no deadline).

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Host name of the broker container in the default deployment.
pub const DEFAULT_HOST: &str = "rabbitmq_weather_to_gif_app";

const ENV_PREFIX: &str = "RABBITMQ";

/// RabbitMQ connection and RPC settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Connection name shown in the broker management UI.
    pub connection_name: String,
    /// Delay between two connection attempts.
    pub retry_delay_secs: u64,
    /// Deadline for a single RPC call, `0` waits forever.
    pub rpc_timeout_ms: u64,
}

impl RabbitMQConfigs {
    /// Loads the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::with_prefix(ENV_PREFIX))
    }

    fn load(env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("host", DEFAULT_HOST)?
            .set_default("port", 5672_i64)?
            .set_default("user", "guest")?
            .set_default("password", "guest")?
            .set_default("vhost", "%2f")?
            .set_default("connection_name", "weather-gif-rpc")?
            .set_default("retry_delay_secs", 5_i64)?
            .set_default("rpc_timeout_ms", 30_000_i64)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// AMQP URI built from the settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        match self.rpc_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
