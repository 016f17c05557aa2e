//! JSON tensor codec for TensorFlow-Serving style `predict` documents.
//!
//! Requests look like `{"instances": [...]}`. A batch is merged by concatenating
//! every request's instances; the backend answers with either a bare JSON array
//! or `{"predictions": [...]}` holding one prediction per merged instance.

use crate::{CodecError, MergedPayload, PayloadCodec};
use bytes::Bytes;
use serde_json::{json, Value};
use std::ops::Range;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstancesCodec;

impl InstancesCodec {
    pub fn new() -> Self {
        Self
    }
}

impl PayloadCodec for InstancesCodec {
    type Input = Vec<Value>;
    type Output = Vec<Value>;

    fn decode(&self, body: &[u8]) -> Result<Vec<Value>, CodecError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| CodecError::BadInput("request body is not valid UTF-8".into()))?;
        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| CodecError::BadInput(format!("invalid JSON: {e}")))?;

        let Value::Object(mut doc) = parsed else {
            return Err(CodecError::BadInput("request body must be a JSON object".into()));
        };

        match doc.remove("instances") {
            Some(Value::Array(instances)) => Ok(instances),
            Some(Value::Null) | None => {
                if doc.get("inputs").is_some_and(|v| !v.is_null()) {
                    Err(CodecError::Unsupported(
                        "column format 'inputs' is not implemented".into(),
                    ))
                } else {
                    Err(CodecError::BadInput(
                        "request must carry an 'instances' field".into(),
                    ))
                }
            }
            // A single instance is treated as a batch of one.
            Some(single) => Ok(vec![single]),
        }
    }

    fn merge(&self, inputs: Vec<Vec<Value>>) -> Result<MergedPayload, CodecError> {
        let total = inputs.iter().map(Vec::len).sum();
        let mut merged = Vec::with_capacity(total);
        let mut slices = Vec::with_capacity(inputs.len());

        for instances in inputs {
            let start = merged.len();
            merged.extend(instances);
            slices.push(start..merged.len());
        }

        let body = serde_json::to_vec(&json!({ "instances": merged }))?;
        debug!(requests = slices.len(), instances = total, "Merged instances");
        Ok(MergedPayload {
            body: Bytes::from(body),
            slices,
        })
    }

    fn split(&self, body: &[u8], slices: &[Range<usize>]) -> Result<Vec<Vec<Value>>, CodecError> {
        let parsed: Value = serde_json::from_slice(body)
            .map_err(|e| CodecError::MalformedResponse(format!("invalid JSON: {e}")))?;

        let predictions = match parsed {
            Value::Array(items) => items,
            Value::Object(mut doc) => match doc.remove("predictions") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(CodecError::MalformedResponse(
                        "response object has no 'predictions' array".into(),
                    ))
                }
            },
            _ => {
                return Err(CodecError::MalformedResponse(
                    "response must be a JSON array or object".into(),
                ))
            }
        };

        let expected = slices.last().map_or(0, |s| s.end);
        if predictions.len() != expected {
            return Err(CodecError::CardinalityMismatch {
                expected,
                got: predictions.len(),
            });
        }

        Ok(slices
            .iter()
            .map(|slice| predictions[slice.clone()].to_vec())
            .collect())
    }

    fn encode(&self, output: Vec<Value>) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(&output)?))
    }
}
