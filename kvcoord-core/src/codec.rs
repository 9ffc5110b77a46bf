//! Value codecs
//!
//! The client never inspects stored payloads; it only moves bytes through a
//! [`Codec`] and hands the decoded form to transforms and watch handlers.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while encoding or decoding a value
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec} encode failed: {reason}")]
    Encode { codec: String, reason: String },

    #[error("{codec} decode failed: {reason}")]
    Decode { codec: String, reason: String },
}

/// Converts between decoded values and the bytes kept in the store
pub trait Codec: Send + Sync + 'static {
    /// Decoded value type
    type Value: Send + 'static;

    /// Encode a value for storage
    fn marshal(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError>;

    /// Decode a stored payload
    fn unmarshal(&self, bytes: &[u8]) -> Result<Self::Value, CodecError>;

    /// Short identifier used in logs and errors
    fn name(&self) -> &str;
}

/// UTF-8 string codec
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Value = String;

    fn marshal(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Decode {
            codec: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn name(&self) -> &str {
        "string"
    }
}

/// JSON codec for any serde type
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("type", &std::any::type_name::<T>()).finish()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn marshal(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            codec: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            codec: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn name(&self) -> &str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Member {
        id: String,
        port: u16,
    }

    #[test]
    fn test_string_codec() {
        let codec = StringCodec;
        let bytes = codec.marshal(&"hello".to_string()).unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(codec.unmarshal(b"hello").unwrap(), "hello");
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        let err = StringCodec.unmarshal(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
        assert!(err.to_string().starts_with("string decode failed"));
    }

    #[test]
    fn test_json_codec_struct() {
        let codec = JsonCodec::<Member>::new();
        let member = Member { id: "node-1".to_string(), port: 7946 };

        let bytes = codec.marshal(&member).unwrap();
        assert_eq!(codec.unmarshal(&bytes).unwrap(), member);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec::<Member>::new();
        let err = codec.unmarshal(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { ref codec, .. } if codec == "json"));
    }

    #[test]
    fn test_json_codec_empty_payload_fails() {
        // Stores that cannot tell a delete from an empty put hand us empty bytes
        assert!(JsonCodec::<u64>::new().unmarshal(b"").is_err());
    }
}
