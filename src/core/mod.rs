// src/core/mod.rs

//! Protocol, request multiplexing and schema logic that does not depend on a
//! live transport.

pub mod errors;
pub mod multiplexer;
pub mod protocol;
pub mod schema;
pub mod tasks;

pub use errors::TntError;
pub use protocol::{Request, Response, ResponseKind};
