// src/core/protocol/mod.rs

pub mod constants;
pub mod frame;
pub mod greeting;
pub mod request;
pub mod response;

pub use constants::IteratorKind;
pub use frame::{DEFAULT_MAX_FRAME_SIZE, Frame, Header, IprotoCodec};
pub use greeting::{GREETING_SIZE, ServerInfo};
pub use request::Request;
pub use response::{Response, ResponseKind};
