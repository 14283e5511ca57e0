// src/core/protocol/constants.rs

//! Numeric codes and map keys of the IPROTO wire format.

use serde::{Deserialize, Serialize};

/// Keys of the header map.
pub mod header_key {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
}

/// Keys of the body map.
pub mod body_key {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const ERROR: u8 = 0x52;
}

/// Keys inside one entry of the extended error stack (`body_key::ERROR`).
pub mod error_key {
    pub const STACK: u8 = 0x00;
    pub const MESSAGE: u8 = 0x03;
}

/// Request type codes, sent in the `CODE` header field.
pub mod request_type {
    pub const SELECT: u32 = 1;
    pub const INSERT: u32 = 2;
    pub const REPLACE: u32 = 3;
    pub const UPDATE: u32 = 4;
    pub const DELETE: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const EVAL: u32 = 8;
    pub const UPSERT: u32 = 9;
    pub const CALL: u32 = 10;
    pub const PING: u32 = 64;
}

/// Response status codes, received in the `CODE` header field.
pub mod response_code {
    pub const OK: u32 = 0x00;
    pub const CHUNK: u32 = 0x80;
    pub const ERROR_BIT: u32 = 0x8000;
}

/// Ids of the system catalog views used to build the schema cache.
pub const VSPACE_ID: u32 = 281;
pub const VINDEX_ID: u32 = 289;

/// The authentication mechanism sent in `AUTH` requests.
pub const AUTH_MECHANISM: &str = "chap-sha1";

/// The kind of index scan requested by a `select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IteratorKind {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
    BitsAllSet,
    BitsAnySet,
    BitsAllNotSet,
    Overlaps,
    Neighbor,
}

impl IteratorKind {
    /// The wire value of this iterator kind.
    pub fn code(self) -> u32 {
        match self {
            IteratorKind::Eq => 0,
            IteratorKind::Req => 1,
            IteratorKind::All => 2,
            IteratorKind::Lt => 3,
            IteratorKind::Le => 4,
            IteratorKind::Ge => 5,
            IteratorKind::Gt => 6,
            IteratorKind::BitsAllSet => 7,
            IteratorKind::BitsAnySet => 8,
            IteratorKind::BitsAllNotSet => 9,
            IteratorKind::Overlaps => 10,
            IteratorKind::Neighbor => 11,
        }
    }
}

impl std::str::FromStr for IteratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EQ" => Ok(IteratorKind::Eq),
            "REQ" => Ok(IteratorKind::Req),
            "ALL" => Ok(IteratorKind::All),
            "LT" => Ok(IteratorKind::Lt),
            "LE" => Ok(IteratorKind::Le),
            "GE" => Ok(IteratorKind::Ge),
            "GT" => Ok(IteratorKind::Gt),
            "BITS_ALL_SET" => Ok(IteratorKind::BitsAllSet),
            "BITS_ANY_SET" => Ok(IteratorKind::BitsAnySet),
            "BITS_ALL_NOT_SET" => Ok(IteratorKind::BitsAllNotSet),
            "OVERLAPS" => Ok(IteratorKind::Overlaps),
            "NEIGHBOR" => Ok(IteratorKind::Neighbor),
            other => Err(format!("unknown iterator kind '{other}'")),
        }
    }
}
