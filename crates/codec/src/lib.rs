//! Payload conversion contract between the proxy and a model's wire format.
//!
//! The batching layer never looks inside request bodies. A [`PayloadCodec`]
//! decodes each request, merges a batch of decoded inputs into one backend
//! body, splits the backend's combined answer back by the recorded offsets,
//! and encodes each caller's share.

pub mod instances;

pub use instances::InstancesCodec;

use bytes::Bytes;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not implemented: {0}")]
    Unsupported(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("backend returned {got} items, expected {expected}")]
    CardinalityMismatch { expected: usize, got: usize },

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the error is attributable to the caller's own payload.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CodecError::BadInput(_) | CodecError::Unsupported(_))
    }
}

/// One merged backend body plus, per input, the range of merged elements it owns.
#[derive(Debug, Clone)]
pub struct MergedPayload {
    pub body: Bytes,
    pub slices: Vec<Range<usize>>,
}

/// Conversion contract for one model wire format.
pub trait PayloadCodec: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Decode one inbound request body.
    fn decode(&self, body: &[u8]) -> Result<Self::Input, CodecError>;

    /// Merge decoded inputs, in order, into a single backend request body.
    fn merge(&self, inputs: Vec<Self::Input>) -> Result<MergedPayload, CodecError>;

    /// Split a combined backend response into one output per slice, in order.
    fn split(&self, body: &[u8], slices: &[Range<usize>]) -> Result<Vec<Self::Output>, CodecError>;

    /// Encode one caller's output into a response body.
    fn encode(&self, output: Self::Output) -> Result<Bytes, CodecError>;

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
