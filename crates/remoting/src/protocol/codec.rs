//! Pluggable request/response codecs, resolved per protocol.

use crate::error::CodecError;
use crate::protocol::message::{Request, Response};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::sync::Arc;

/// Encodes and decodes messages for one protocol.
pub trait Codec: Debug + Send + Sync + 'static {
    /// Codec name, used in logs.
    fn name(&self) -> &'static str;

    /// Encode an outgoing request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError>;

    /// Decode a request received by a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid request.
    fn decode_request(&self, frame: &[u8]) -> Result<Request, CodecError>;

    /// Encode a response sent by a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be serialized.
    fn encode_response(&self, response: &Response) -> Result<Bytes, CodecError>;

    /// Decode an incoming response.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid response.
    fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError>;
}

/// Encode a value into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(msg, &mut vec)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a value.
///
/// # Errors
///
/// Returns an error if the data is invalid or the value cannot be deserialized.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(data).map_err(Into::into)
}

/// CBOR encoding of the whole message envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError> {
        encode(request)
    }

    fn decode_request(&self, frame: &[u8]) -> Result<Request, CodecError> {
        decode(frame)
    }

    fn encode_response(&self, response: &Response) -> Result<Bytes, CodecError> {
        encode(response)
    }

    fn decode_response(&self, frame: &[u8]) -> Result<Response, CodecError> {
        decode(frame)
    }
}

/// Codecs keyed by protocol name.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: DashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create a registry with no codecs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// Register `codec` for `protocol`, replacing any previous entry.
    pub fn register(&self, protocol: &str, codec: Arc<dyn Codec>) {
        self.codecs.insert(protocol.to_string(), codec);
    }

    /// Look up the codec for `protocol`.
    #[must_use]
    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(protocol).map(|c| Arc::clone(c.value()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.register("dubbo", Arc::new(CborCodec));
        registry.register("cbor", Arc::new(CborCodec));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbor_request_frame() {
        let codec = CborCodec;
        let request = Request::two_way(Bytes::from_static(b"hello"));

        let frame = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn test_decode_error() {
        let bad_data = vec![0xFF, 0xFF, 0xFF];
        assert!(CborCodec.decode_response(&bad_data).is_err());
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.get("dubbo").unwrap().name(), "cbor");
        assert!(registry.get("hessian").is_none());

        let empty = CodecRegistry::empty();
        assert!(empty.get("dubbo").is_none());
        empty.register("dubbo", Arc::new(CborCodec));
        assert!(empty.get("dubbo").is_some());
    }
}
