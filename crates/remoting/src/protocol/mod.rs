//! Protocol layer: messages and codecs.
//!
//! The wire format of a request is owned by the codec resolved for the
//! client's protocol; the transport core only sees [`Request`] and
//! [`Response`] values.

pub mod codec;
pub mod message;

pub use codec::{CborCodec, Codec, CodecRegistry};
pub use message::{PROTOCOL_VERSION, Request, RequestId, Response};
