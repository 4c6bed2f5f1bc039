//! Message serialization contract.
//!
//! A message is serialized exactly once at publish and deserialized exactly
//! once when a claim is handed to a worker. The default codec is JSON;
//! hosts can plug in anything that round-trips serde types.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Converts messages to and from stored payload blobs.
pub trait Serializer: Send + Sync + 'static {
    /// Serializes a message into a payload blob.
    fn serialize<M: Serialize>(&self, message: &M) -> Result<Bytes>;

    /// Deserializes a payload blob back into a message.
    fn deserialize<M: DeserializeOwned>(&self, payload: &[u8]) -> Result<M>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Creates a new JSON serializer.
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn serialize<M: Serialize>(&self, message: &M) -> Result<Bytes> {
        let payload =
            serde_json::to_vec(message).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(Bytes::from(payload))
    }

    fn deserialize<M: DeserializeOwned>(&self, payload: &[u8]) -> Result<M> {
        serde_json::from_slice(payload).map_err(|e| Error::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::new();
        let order = Order { id: 7, sku: "widget".into() };

        let payload = serializer.serialize(&order).unwrap();
        let decoded: Order = serializer.deserialize(&payload).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn corrupt_payload_reports_serialization_error() {
        let serializer = JsonSerializer::new();
        let err = serializer.deserialize::<Order>(b"not json").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
