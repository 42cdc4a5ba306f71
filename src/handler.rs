// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request Handlers
//!
//! The capability an [`RpcServer`](crate::server::RpcServer) invokes for every
//! request it dequeues. Domain handlers (weather, GIF) implement it; ad-hoc
//! handlers can be built from an async closure with [`handler_fn`].

use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, marker::PhantomData};

/// Processes one decoded request and produces the reply to send back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send;

    async fn process(&self, request: Self::Request) -> Result<Self::Response, HandlerError>;
}

/// A [`RequestHandler`] backed by an async closure.
pub struct FnHandler<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req) -> Res>,
}

/// Wraps `f` into a [`RequestHandler`].
///
/// ```ignore
/// let echo = handler_fn(|req: GifRequest| async move {
///     Ok(GifResponse { gif_url: "http://x/1.gif".into(), title: req.rating })
/// });
/// ```
pub fn handler_fn<F, Fut, Req, Res>(f: F) -> FnHandler<F, Req, Res>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Res> RequestHandler for FnHandler<F, Req, Res>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    type Request = Req;
    type Response = Res;

    async fn process(&self, request: Req) -> Result<Res, HandlerError> {
        (self.f)(request).await
    }
}
