// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::config::ClientConfig;
pub use crate::connection::{Connection, ConnectionState, ResponseStream, SelectOptions};
pub use crate::core::TntError;
pub use crate::core::protocol::IteratorKind;
pub use rmpv::Value;
