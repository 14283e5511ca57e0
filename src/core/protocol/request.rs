// src/core/protocol/request.rs

//! Logical requests and the encoding of their bodies.

use super::constants::{AUTH_MECHANISM, IteratorKind, body_key, request_type};
use crate::core::TntError;
use bytes::Bytes;
use rmpv::Value;
use std::io::Write;

/// A request as issued by the client, before a correlation id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Auth {
        user: String,
        scramble: Vec<u8>,
    },
    Select {
        space_id: u32,
        index_id: u32,
        key: Vec<Value>,
        iterator: IteratorKind,
        limit: u32,
        offset: u32,
    },
    Insert {
        space_id: u32,
        tuple: Vec<Value>,
    },
    Replace {
        space_id: u32,
        tuple: Vec<Value>,
    },
    Delete {
        space_id: u32,
        index_id: u32,
        key: Vec<Value>,
    },
    Update {
        space_id: u32,
        index_id: u32,
        key: Vec<Value>,
        operations: Vec<Value>,
    },
    Upsert {
        space_id: u32,
        tuple: Vec<Value>,
        operations: Vec<Value>,
    },
    Call {
        function: String,
        args: Vec<Value>,
    },
    Eval {
        expression: String,
        args: Vec<Value>,
    },
}

impl Request {
    /// The request type written into the `CODE` header field.
    pub fn code(&self) -> u32 {
        match self {
            Request::Ping => request_type::PING,
            Request::Auth { .. } => request_type::AUTH,
            Request::Select { .. } => request_type::SELECT,
            Request::Insert { .. } => request_type::INSERT,
            Request::Replace { .. } => request_type::REPLACE,
            Request::Delete { .. } => request_type::DELETE,
            Request::Update { .. } => request_type::UPDATE,
            Request::Upsert { .. } => request_type::UPSERT,
            Request::Call { .. } => request_type::CALL,
            Request::Eval { .. } => request_type::EVAL,
        }
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Auth { .. } => "auth",
            Request::Select { .. } => "select",
            Request::Insert { .. } => "insert",
            Request::Replace { .. } => "replace",
            Request::Delete { .. } => "delete",
            Request::Update { .. } => "update",
            Request::Upsert { .. } => "upsert",
            Request::Call { .. } => "call",
            Request::Eval { .. } => "eval",
        }
    }

    /// Encodes the body map. `Ping` has no body and yields empty bytes.
    pub fn encode_body(&self) -> Result<Bytes, TntError> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Request::Ping => {}
            Request::Auth { user, scramble } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                write_key(&mut buf, body_key::USER_NAME)?;
                rmp::encode::write_str(&mut buf, user)?;
                write_key(&mut buf, body_key::TUPLE)?;
                rmp::encode::write_array_len(&mut buf, 2)?;
                rmp::encode::write_str(&mut buf, AUTH_MECHANISM)?;
                rmp::encode::write_str_len(&mut buf, scramble.len() as u32)?;
                buf.write_all(scramble)?;
            }
            Request::Select {
                space_id,
                index_id,
                key,
                iterator,
                limit,
                offset,
            } => {
                rmp::encode::write_map_len(&mut buf, 6)?;
                write_uint_entry(&mut buf, body_key::SPACE_ID, u64::from(*space_id))?;
                write_uint_entry(&mut buf, body_key::INDEX_ID, u64::from(*index_id))?;
                write_uint_entry(&mut buf, body_key::LIMIT, u64::from(*limit))?;
                write_uint_entry(&mut buf, body_key::OFFSET, u64::from(*offset))?;
                write_uint_entry(&mut buf, body_key::ITERATOR, u64::from(iterator.code()))?;
                write_array_entry(&mut buf, body_key::KEY, key)?;
            }
            Request::Insert { space_id, tuple } | Request::Replace { space_id, tuple } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                write_uint_entry(&mut buf, body_key::SPACE_ID, u64::from(*space_id))?;
                write_array_entry(&mut buf, body_key::TUPLE, tuple)?;
            }
            Request::Delete {
                space_id,
                index_id,
                key,
            } => {
                rmp::encode::write_map_len(&mut buf, 3)?;
                write_uint_entry(&mut buf, body_key::SPACE_ID, u64::from(*space_id))?;
                write_uint_entry(&mut buf, body_key::INDEX_ID, u64::from(*index_id))?;
                write_array_entry(&mut buf, body_key::KEY, key)?;
            }
            Request::Update {
                space_id,
                index_id,
                key,
                operations,
            } => {
                rmp::encode::write_map_len(&mut buf, 4)?;
                write_uint_entry(&mut buf, body_key::SPACE_ID, u64::from(*space_id))?;
                write_uint_entry(&mut buf, body_key::INDEX_ID, u64::from(*index_id))?;
                write_array_entry(&mut buf, body_key::KEY, key)?;
                write_array_entry(&mut buf, body_key::TUPLE, operations)?;
            }
            Request::Upsert {
                space_id,
                tuple,
                operations,
            } => {
                rmp::encode::write_map_len(&mut buf, 3)?;
                write_uint_entry(&mut buf, body_key::SPACE_ID, u64::from(*space_id))?;
                write_array_entry(&mut buf, body_key::TUPLE, tuple)?;
                write_array_entry(&mut buf, body_key::OPS, operations)?;
            }
            Request::Call { function, args } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                write_key(&mut buf, body_key::FUNCTION_NAME)?;
                rmp::encode::write_str(&mut buf, function)?;
                write_array_entry(&mut buf, body_key::TUPLE, args)?;
            }
            Request::Eval { expression, args } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                write_key(&mut buf, body_key::EXPR)?;
                rmp::encode::write_str(&mut buf, expression)?;
                write_array_entry(&mut buf, body_key::TUPLE, args)?;
            }
        }
        Ok(Bytes::from(buf))
    }
}

fn write_key(buf: &mut Vec<u8>, key: u8) -> Result<(), TntError> {
    rmp::encode::write_uint(buf, u64::from(key))?;
    Ok(())
}

fn write_uint_entry(buf: &mut Vec<u8>, key: u8, value: u64) -> Result<(), TntError> {
    write_key(buf, key)?;
    rmp::encode::write_uint(buf, value)?;
    Ok(())
}

fn write_array_entry(buf: &mut Vec<u8>, key: u8, items: &[Value]) -> Result<(), TntError> {
    write_key(buf, key)?;
    rmp::encode::write_array_len(buf, items.len() as u32)?;
    for item in items {
        rmpv::encode::write_value(buf, item)?;
    }
    Ok(())
}
