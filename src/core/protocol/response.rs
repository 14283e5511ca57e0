// src/core/protocol/response.rs

//! Interpretation of inbound frames as typed responses.

use super::constants::{body_key, error_key, response_code};
use super::frame::Frame;
use crate::core::TntError;
use rmpv::Value;
use serde::de::DeserializeOwned;

/// What a frame means, decided once at decode time from its status code.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Terminal success. `data` is absent for bodiless replies such as ping.
    Ok { data: Option<Value> },
    /// Terminal failure reported by the server.
    Error { code: u32, message: String },
    /// Out-of-band value delivered before the terminal response.
    Push { data: Value },
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub sync: u64,
    pub code: u32,
    pub schema_version: u64,
    pub kind: ResponseKind,
}

impl Response {
    /// Decodes the body of `frame` according to its status code.
    pub fn from_frame(frame: &Frame) -> Result<Self, TntError> {
        let header = frame.header;
        let known = header.code == response_code::OK
            || header.code == response_code::CHUNK
            || header.code & response_code::ERROR_BIT != 0;
        if !known {
            return Err(TntError::Protocol(format!(
                "unexpected response code 0x{:x}",
                header.code
            )));
        }
        let mut body = decode_body(&frame.body)?;

        let kind = if header.code == response_code::OK {
            ResponseKind::Ok {
                data: take(&mut body, body_key::DATA),
            }
        } else if header.code == response_code::CHUNK {
            ResponseKind::Push {
                data: take(&mut body, body_key::DATA).unwrap_or(Value::Nil),
            }
        } else {
            ResponseKind::Error {
                code: header.code & !response_code::ERROR_BIT,
                message: error_message(&mut body),
            }
        };

        Ok(Self {
            sync: header.sync,
            code: header.code,
            schema_version: header.schema_version,
            kind,
        })
    }

    pub fn is_push(&self) -> bool {
        matches!(self.kind, ResponseKind::Push { .. })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.kind, ResponseKind::Ok { .. })
    }

    /// Turns an error reply into `TntError::Server`.
    pub fn into_result(self) -> Result<Self, TntError> {
        match self.kind {
            ResponseKind::Error { code, message } => Err(TntError::Server { code, message }),
            _ => Ok(self),
        }
    }

    /// The raw `DATA` payload, if any.
    pub fn data(&self) -> Option<&Value> {
        match &self.kind {
            ResponseKind::Ok { data } => data.as_ref(),
            ResponseKind::Push { data } => Some(data),
            ResponseKind::Error { .. } => None,
        }
    }

    /// The elements of the `DATA` array: tuples for data requests, return
    /// values for calls. Empty when there is no payload.
    pub fn rows(&self) -> Vec<Value> {
        match self.data() {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Nil) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        }
    }

    pub fn into_rows(self) -> Vec<Value> {
        let data = match self.kind {
            ResponseKind::Ok { data } => data,
            ResponseKind::Push { data } => Some(data),
            ResponseKind::Error { .. } => None,
        };
        match data {
            Some(Value::Array(items)) => items,
            Some(Value::Nil) | None => Vec::new(),
            Some(other) => vec![other],
        }
    }

    /// Deserializes the `DATA` payload into a typed value.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, TntError> {
        let data = self.data().cloned().unwrap_or(Value::Nil);
        Ok(rmpv::ext::from_value(data)?)
    }
}

// The header was already valid, so a bad body only spoils this one response.
fn decode_body(body: &[u8]) -> Result<Vec<(Value, Value)>, TntError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut rd = body;
    let value = rmpv::decode::read_value(&mut rd)
        .map_err(|e| TntError::Decode(format!("malformed response body: {e}")))?;
    match value {
        Value::Map(entries) => Ok(entries),
        Value::Nil => Ok(Vec::new()),
        other => Err(TntError::Decode(format!(
            "response body is not a map: {other}"
        ))),
    }
}

fn take(entries: &mut Vec<(Value, Value)>, key: u8) -> Option<Value> {
    let pos = entries
        .iter()
        .position(|(k, _)| k.as_u64() == Some(u64::from(key)))?;
    Some(entries.swap_remove(pos).1)
}

fn error_message(entries: &mut Vec<(Value, Value)>) -> String {
    if let Some(Value::String(s)) = take(entries, body_key::ERROR_24)
        && let Some(msg) = s.into_str()
    {
        return msg;
    }

    // Extended error: {STACK: [{MESSAGE: "...", ...}, ...]}
    if let Some(Value::Map(mut error)) = take(entries, body_key::ERROR)
        && let Some(Value::Array(stack)) = take(&mut error, error_key::STACK)
        && let Some(Value::Map(mut first)) = stack.into_iter().next()
        && let Some(Value::String(s)) = take(&mut first, error_key::MESSAGE)
        && let Some(msg) = s.into_str()
    {
        return msg;
    }

    "unknown error".to_string()
}
