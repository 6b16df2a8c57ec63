//! Payload codecs and the envelope that makes them recoverable
//!
//! Every value stored through the facade is wrapped in a one-byte envelope
//! carrying the codec id, so the codec chosen at write time is recoverable
//! at read time regardless of which engine served the read.

use crate::errors::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Available payload codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Compact binary encoding; the default for machine-facing payloads
    Binary,
    /// Human-readable JSON; also the fallback for values the binary codec
    /// cannot represent
    Json,
}

impl Codec {
    pub const fn id(self) -> u8 {
        match self {
            Codec::Binary => 1,
            Codec::Json => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Codec> {
        match id {
            1 => Some(Codec::Binary),
            2 => Some(Codec::Json),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Codec::Binary => "binary",
            Codec::Json => "json",
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> std::result::Result<Vec<u8>, String> {
        match self {
            Codec::Binary => bincode::serialize(value).map_err(|e| e.to_string()),
            Codec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> std::result::Result<T, String> {
        match self {
            Codec::Binary => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            Codec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }
}

/// Registry choosing the codec per value and framing the envelope
#[derive(Debug, Clone)]
pub struct SerializerRegistry {
    default: Codec,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        SerializerRegistry {
            default: Codec::Binary,
        }
    }
}

impl SerializerRegistry {
    pub fn new(default: Codec) -> Self {
        SerializerRegistry { default }
    }

    /// Encode `value` with the best available codec.
    ///
    /// The default codec is tried first; values it cannot represent (for
    /// example maps with non-string keys under JSON, or self-describing
    /// structures under bincode) fall back to the other codec. The chosen
    /// codec id is prepended so `decode` can recover it.
    pub fn encode<T: Serialize>(&self, context: &str, value: &T) -> Result<Vec<u8>> {
        let attempt = |codec: Codec| -> std::result::Result<Vec<u8>, String> {
            let payload = codec.encode(value)?;
            let mut framed = Vec::with_capacity(payload.len() + 1);
            framed.push(codec.id());
            framed.extend_from_slice(&payload);
            Ok(framed)
        };

        match attempt(self.default) {
            Ok(framed) => Ok(framed),
            Err(primary) => {
                let fallback = match self.default {
                    Codec::Binary => Codec::Json,
                    Codec::Json => Codec::Binary,
                };
                attempt(fallback).map_err(|secondary| {
                    CacheError::serialization(
                        context,
                        format!("{primary}; fallback {}: {secondary}", fallback.name()),
                    )
                })
            }
        }
    }

    /// Decode an enveloped payload using the codec recorded in its frame
    pub fn decode<T: DeserializeOwned>(&self, context: &str, bytes: &[u8]) -> Result<T> {
        let (&id, payload) = bytes
            .split_first()
            .ok_or_else(|| CacheError::serialization(context, "empty payload"))?;
        let codec = Codec::from_id(id)
            .ok_or_else(|| CacheError::serialization(context, format!("unknown codec id {id}")))?;
        codec
            .decode(payload)
            .map_err(|detail| CacheError::serialization(context, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trip_default_codec() {
        let registry = SerializerRegistry::default();
        let framed = registry.encode("t", &("hello".to_string(), 42u64)).unwrap();
        assert_eq!(framed[0], Codec::Binary.id());
        let decoded: (String, u64) = registry.decode("t", &framed).unwrap();
        assert_eq!(decoded, ("hello".to_string(), 42));
    }

    #[test]
    fn codec_is_recovered_from_frame_not_registry() {
        let json_registry = SerializerRegistry::new(Codec::Json);
        let framed = json_registry.encode("t", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(framed[0], Codec::Json.id());

        // A registry defaulting to binary still decodes the JSON frame
        let binary_registry = SerializerRegistry::default();
        let decoded: Vec<u32> = binary_registry.decode("t", &framed).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn json_default_falls_back_for_non_string_keys() {
        let registry = SerializerRegistry::new(Codec::Json);
        let mut map = HashMap::new();
        map.insert((1u8, 2u8), "v".to_string());
        let framed = registry.encode("t", &map).unwrap();
        assert_eq!(framed[0], Codec::Binary.id());
        let decoded: HashMap<(u8, u8), String> = registry.decode("t", &framed).unwrap();
        assert_eq!(decoded.get(&(1, 2)).map(String::as_str), Some("v"));
    }

    #[test]
    fn decode_rejects_garbage() {
        let registry = SerializerRegistry::default();
        assert!(registry.decode::<u32>("t", &[]).is_err());
        assert!(registry.decode::<u32>("t", &[99, 1, 2]).is_err());
    }
}
