// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Process
//!
//! Runs the weather and GIF servers side by side on one shared connection,
//! each on its own channel and task.

use crate::{
    connection::BrokerConnection,
    errors::AmqpError,
    gif::{gif_server, GifHandler, GifSource},
    weather::{weather_server, WeatherHandler},
};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{error, info};

/// Serves `weather_rpc_queue` and `gif_rpc_queue` until both consumers stop.
pub async fn run<S>(
    connection: &BrokerConnection,
    weather: Arc<WeatherHandler>,
    gif: Arc<GifHandler<S>>,
) -> Result<(), AmqpError>
where
    S: GifSource + 'static,
{
    let weather = weather_server(connection, weather).await?;
    let gif = gif_server(connection, gif).await?;

    info!("worker started");

    let spawns = vec![
        tokio::spawn(async move { weather.consume().await }),
        tokio::spawn(async move { gif.consume().await }),
    ];

    for res in join_all(spawns).await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = err.to_string(), "rpc server failed");
                return Err(err);
            }
            Err(err) => {
                error!(error = err.to_string(), "tokio process error");
                return Err(AmqpError::InternalError);
            }
        }
    }

    Ok(())
}
