// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serializers
//!
//! Serializers are keyed by content type. The dispatcher picks the serializer
//! matching the `content_type` of a delivery and falls back to the registered
//! default when the delivery carries none or an unknown one.
//!
//! Codecs exchange `serde_json::Value` with the typed layer, so any format
//! speaking the serde data model can be plugged in without the handler
//! contract knowing about it.

use crate::{
    envelope::{Contract, Envelope},
    errors::BusError,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A payload codec for one content type.
pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, BusError>;

    fn deserialize(&self, data: &[u8]) -> Result<Value, BusError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(value).map_err(|e| BusError::Serialize(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value, BusError> {
        serde_json::from_slice(data).map_err(|e| BusError::Deserialize(e.to_string()))
    }
}

/// Content-type keyed set of serializers with a default fallback.
#[derive(Clone)]
pub struct Serializers {
    by_content_type: HashMap<String, Arc<dyn Serializer>>,
    default: Arc<dyn Serializer>,
}

impl Default for Serializers {
    fn default() -> Self {
        Serializers::new(Arc::new(JsonSerializer))
    }
}

impl Serializers {
    pub fn new(default: Arc<dyn Serializer>) -> Self {
        let mut by_content_type = HashMap::new();
        by_content_type.insert(default.content_type().to_owned(), default.clone());
        Serializers {
            by_content_type,
            default,
        }
    }

    pub fn register(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.by_content_type
            .insert(serializer.content_type().to_owned(), serializer);
        self
    }

    pub fn default_content_type(&self) -> &str {
        self.default.content_type()
    }

    /// Serializer for `content_type`, or the default one.
    pub fn select(&self, content_type: Option<&str>) -> Arc<dyn Serializer> {
        match content_type {
            None => self.default.clone(),
            Some(ct) => match self.by_content_type.get(ct) {
                Some(s) => s.clone(),
                None => {
                    warn!(content_type = ct, "unknown content type, using default serializer");
                    self.default.clone()
                }
            },
        }
    }

    /// Decodes the envelope payload as `T`.
    pub fn decode<T: Contract>(&self, env: &Envelope) -> Result<T, BusError> {
        let value = self.select(env.content_type.as_deref()).deserialize(&env.data)?;
        serde_json::from_value(value).map_err(|e| BusError::Deserialize(e.to_string()))
    }

    /// Encodes `value` into a fresh envelope using the default serializer.
    pub fn encode<T: Contract>(&self, value: &T) -> Result<Envelope, BusError> {
        let mut env = Envelope::new(T::contract_key(), Vec::new());
        self.encode_into(value, &mut env)?;
        Ok(env)
    }

    /// Encodes `value` into `env`, keeping its other metadata.
    pub fn encode_into<T: Contract>(&self, value: &T, env: &mut Envelope) -> Result<(), BusError> {
        let json = serde_json::to_value(value).map_err(|e| BusError::Serialize(e.to_string()))?;
        env.data = self.default.serialize(&json)?;
        env.content_type = Some(self.default.content_type().to_owned());
        env.contract = T::contract_key();
        Ok(())
    }
}
