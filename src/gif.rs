// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # GIF Service
//!
//! Wire models for `gif_rpc_queue`, the handler answering them and a typed client.
//! The actual GIF lookup is provided by a [`GifSource`].

use crate::{
    client::{RpcClient, RpcClientConfig},
    connection::BrokerConnection,
    errors::{AmqpError, HandlerError},
    handler::RequestHandler,
    queue::GIF_RPC_QUEUE,
    server::RpcServer,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Content rating applied when the caller does not pick one.
pub const DEFAULT_RATING: &str = "pg-13";

fn default_rating() -> String {
    DEFAULT_RATING.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GifRequest {
    /// Search tag, any GIF when absent.
    pub tag: Option<String>,
    #[serde(default = "default_rating")]
    pub rating: String,
}

impl GifRequest {
    pub fn new(tag: Option<&str>) -> GifRequest {
        GifRequest {
            tag: tag.map(str::to_owned),
            rating: default_rating(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GifResponse {
    pub gif_url: String,
    pub title: String,
}

/// Looks up a random GIF matching a tag.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GifSource: Send + Sync {
    /// `Ok(None)` when nothing matches.
    async fn random_gif(
        &self,
        tag: Option<String>,
        rating: String,
    ) -> Result<Option<GifResponse>, HandlerError>;
}

/// Answers GIF requests from a [`GifSource`].
pub struct GifHandler<S> {
    source: S,
}

impl<S: GifSource> GifHandler<S> {
    /// Creates a handler backed by `source`.
    ///
    /// # Parameters
    /// * `source` - Provider of random GIFs
    pub fn new(source: S) -> GifHandler<S> {
        GifHandler { source }
    }
}

#[async_trait]
impl<S: GifSource> RequestHandler for GifHandler<S> {
    type Request = GifRequest;
    type Response = GifResponse;

    async fn process(&self, request: GifRequest) -> Result<GifResponse, HandlerError> {
        info!(tag = request.tag.as_deref(), "fetching gif");

        self.source
            .random_gif(request.tag, request.rating)
            .await?
            .ok_or_else(|| HandlerError::NotFound("no gifs found for this query".to_owned()))
    }
}

/// Builds the server answering `gif_rpc_queue`.
pub async fn gif_server<S: GifSource>(
    connection: &BrokerConnection,
    handler: Arc<GifHandler<S>>,
) -> Result<RpcServer<GifHandler<S>>, AmqpError> {
    RpcServer::new(connection, GIF_RPC_QUEUE, handler).await
}

/// Client side of `gif_rpc_queue`.
pub struct GifRpcClient {
    client: RpcClient,
}

impl GifRpcClient {
    pub async fn new(
        connection: &BrokerConnection,
        config: RpcClientConfig,
    ) -> Result<GifRpcClient, AmqpError> {
        Ok(GifRpcClient {
            client: RpcClient::new(connection, config).await?,
        })
    }

    pub async fn request_gif(&self, request: &GifRequest) -> Result<GifResponse, AmqpError> {
        self.client.send_request(request, GIF_RPC_QUEUE).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn cats() -> GifResponse {
        GifResponse {
            gif_url: "http://x/1.gif".to_owned(),
            title: "Cats".to_owned(),
        }
    }

    #[test]
    fn rating_defaults_to_pg13() {
        let request: GifRequest = serde_json::from_str(r#"{"tag": null}"#).unwrap();

        assert_eq!(request, GifRequest::new(None));
        assert_eq!(request.rating, "pg-13");
    }

    #[test]
    fn wire_shapes_round_trip() {
        let request = GifRequest::new(Some("cats"));
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"tag":"cats","rating":"pg-13"}"#);
        assert_eq!(serde_json::from_str::<GifRequest>(&json).unwrap(), request);

        let json = serde_json::to_string(&cats()).unwrap();
        assert_eq!(json, r#"{"gif_url":"http://x/1.gif","title":"Cats"}"#);
        assert_eq!(serde_json::from_str::<GifResponse>(&json).unwrap(), cats());
    }

    #[tokio::test]
    async fn handler_returns_the_source_gif() {
        let mut source = MockGifSource::new();
        source
            .expect_random_gif()
            .with(eq(Some("cats".to_owned())), eq("pg-13".to_owned()))
            .times(1)
            .returning(|_, _| Ok(Some(cats())));

        let handler = GifHandler::new(source);

        assert_eq!(handler.process(GifRequest::new(Some("cats"))).await, Ok(cats()));
    }

    #[tokio::test]
    async fn handler_reports_empty_results_as_not_found() {
        let mut source = MockGifSource::new();
        source.expect_random_gif().returning(|_, _| Ok(None));

        let handler = GifHandler::new(source);

        assert!(matches!(
            handler.process(GifRequest::new(Some("nothing"))).await,
            Err(HandlerError::NotFound(_))
        ));
    }
}
