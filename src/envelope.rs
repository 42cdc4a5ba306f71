// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! The unit of exchange between RPC clients and servers. A request envelope
//! carries a JSON body, a freshly minted correlation id and the reply-to
//! address of the caller's reply queue. A reply envelope echoes the
//! correlation id and has no reply-to.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt};
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Token linking a reply to the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a new random (UUID v4) correlation id.
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as seen by the RPC layer, independent of the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// String headers, used for trace context propagation.
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Builds a request envelope for `payload` addressed back to `reply_to`.
    pub fn request<T: Serialize>(
        payload: &T,
        correlation_id: &CorrelationId,
        reply_to: &str,
    ) -> Result<Envelope, AmqpError> {
        Ok(Envelope {
            body: encode(payload)?,
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_to.to_owned()),
            headers: BTreeMap::default(),
        })
    }

    /// Builds a reply envelope echoing `correlation_id`.
    pub fn reply<T: Serialize>(payload: &T, correlation_id: &str) -> Result<Envelope, AmqpError> {
        Ok(Envelope {
            body: encode(payload)?,
            correlation_id: Some(correlation_id.to_owned()),
            reply_to: None,
            headers: BTreeMap::default(),
        })
    }

    /// Deserializes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Whether this envelope answers the call identified by `id`.
    pub fn correlates_with(&self, id: &CorrelationId) -> bool {
        self.correlation_id.as_deref() == Some(id.as_str())
    }
}

/// An envelope handed out by a consumer, with the tag used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub envelope: Envelope,
}

fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError
    })
}
