// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Weather Service
//!
//! Wire models for `weather_rpc_queue`, the handler answering them and a typed
//! client.
//!
//! The handler is a registry of named weather services. Each service pairs a
//! [`ForecastSource`], which fetches raw forecast samples for a city, with a
//! [`ForecastFormatter`], which turns them into human readable lines. Callers
//! pick the service by name in every request.

use crate::{
    client::{RpcClient, RpcClientConfig},
    connection::BrokerConnection,
    errors::{AmqpError, HandlerError},
    handler::RequestHandler,
    queue::WEATHER_RPC_QUEUE,
    server::RpcServer,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRequest {
    pub service_name: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherResponse {
    pub service: String,
    pub city: String,
    pub forecast: Vec<String>,
}

/// One raw forecast sample (typically a three hour slot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub dt_txt: String,
    pub temp: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: u8,
    pub description: String,
}

/// Fetches raw forecast samples for a city.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self, city: &str) -> Result<Vec<ForecastEntry>, HandlerError>;
}

/// Turns raw forecast samples into readable lines.
pub trait ForecastFormatter: Send + Sync {
    fn format(&self, forecast: &[ForecastEntry]) -> Vec<String>;
}

/// One sentence per sample, temperatures in Celsius.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWeatherFormatter;

impl ForecastFormatter for OpenWeatherFormatter {
    fn format(&self, forecast: &[ForecastEntry]) -> Vec<String> {
        forecast
            .iter()
            .map(|entry| {
                format!(
                    "On {}, the temperature will be {}°C, with {}. It will feel like {}°C. \
                     The temperature range will be between {}°C to {}°C, and the humidity will be {}%.",
                    entry.dt_txt,
                    entry.temp,
                    entry.description,
                    entry.feels_like,
                    entry.temp_min,
                    entry.temp_max,
                    entry.humidity
                )
            })
            .collect()
    }
}

struct WeatherService {
    source: Arc<dyn ForecastSource>,
    formatter: Arc<dyn ForecastFormatter>,
}

/// Dispatches weather requests to the service they name.
#[derive(Default)]
pub struct WeatherHandler {
    services: HashMap<String, WeatherService>,
}

impl WeatherHandler {
    /// Creates a handler with no registered service.
    ///
    /// # Returns
    /// An empty registry; every request is answered with `NotFound` until a
    /// service is registered.
    pub fn new() -> WeatherHandler {
        WeatherHandler::default()
    }

    /// Registers a service under `name`, replacing any previous one.
    pub fn register(
        mut self,
        name: &str,
        source: Arc<dyn ForecastSource>,
        formatter: Arc<dyn ForecastFormatter>,
    ) -> Self {
        self.services
            .insert(name.to_owned(), WeatherService { source, formatter });
        self
    }
}

#[async_trait]
impl RequestHandler for WeatherHandler {
    type Request = WeatherRequest;
    type Response = WeatherResponse;

    async fn process(&self, request: WeatherRequest) -> Result<WeatherResponse, HandlerError> {
        let WeatherRequest { service_name, city } = request;

        if city.trim().is_empty() {
            return Err(HandlerError::InvalidRequest(
                "city name must be provided".to_owned(),
            ));
        }

        let Some(service) = self.services.get(&service_name) else {
            warn!(service = service_name.as_str(), "unknown weather service");
            return Err(HandlerError::NotFound(format!(
                "weather service '{service_name}' not found"
            )));
        };

        info!(service = service_name.as_str(), city = city.as_str(), "fetching forecast");
        let raw = service.source.fetch(&city).await?;
        if raw.is_empty() {
            return Err(HandlerError::NotFound(format!(
                "no forecast data found for city: {city}"
            )));
        }

        Ok(WeatherResponse {
            forecast: service.formatter.format(&raw),
            service: service_name,
            city,
        })
    }
}

/// Builds the server answering `weather_rpc_queue`.
pub async fn weather_server(
    connection: &BrokerConnection,
    handler: Arc<WeatherHandler>,
) -> Result<RpcServer<WeatherHandler>, AmqpError> {
    RpcServer::new(connection, WEATHER_RPC_QUEUE, handler).await
}

/// Client side of `weather_rpc_queue`.
pub struct WeatherRpcClient {
    client: RpcClient,
}

impl WeatherRpcClient {
    pub async fn new(
        connection: &BrokerConnection,
        config: RpcClientConfig,
    ) -> Result<WeatherRpcClient, AmqpError> {
        Ok(WeatherRpcClient {
            client: RpcClient::new(connection, config).await?,
        })
    }

    pub async fn request_forecast(
        &self,
        service_name: &str,
        city: &str,
    ) -> Result<WeatherResponse, AmqpError> {
        let request = WeatherRequest {
            service_name: service_name.to_owned(),
            city: city.to_owned(),
        };
        self.client.send_request(&request, WEATHER_RPC_QUEUE).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.client.close().await
    }
}
