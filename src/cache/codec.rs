//! Value Codec
//!
//! Turns typed values into payload bytes and back. Independent of the
//! record framing used by any backend.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

// == Value Codec Trait ==
/// Encodes and decodes non-raw cache values.
pub trait ValueCodec: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

// == JSON Codec ==
/// Default codec: compact JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[test]
    fn test_json_codec_struct() {
        let profile = Profile {
            name: "ada".to_string(),
            visits: 3,
        };
        let bytes = JsonCodec.encode(&profile).unwrap();
        assert_eq!(bytes, br#"{"name":"ada","visits":3}"#);
        assert_eq!(JsonCodec.decode::<Profile>(&bytes).unwrap(), profile);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let result = JsonCodec.decode::<Profile>(b"not json");
        assert!(matches!(result, Err(CacheError::Codec(_))));
    }
}
