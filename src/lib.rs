// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Request/response RPC over RabbitMQ for the weather and GIF workers.
//!
//! Clients publish a request carrying a fresh correlation id and the name of
//! their private reply queue; a server consuming the matching work queue runs
//! its handler and publishes the result back with the same correlation id.

mod otel;

pub mod amqp;
pub mod client;
pub mod configs;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod gif;
pub mod handler;
pub mod memory;
pub mod queue;
pub mod server;
pub mod transport;
pub mod weather;
pub mod worker;
