// src/core/protocol/greeting.rs

//! Parsing of the fixed-size server greeting and the `chap-sha1` scramble
//! derived from its salt.

use crate::core::TntError;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Size of the greeting the server sends immediately after accept.
pub const GREETING_SIZE: usize = 128;
const GREETING_LINE_SIZE: usize = 64;
const SALT_BASE64_LEN: usize = 44;
const SCRAMBLE_SIZE: usize = 20;
const SERVER_BANNER: &str = "Tarantool";

/// Identity of the server, taken from the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub protocol: String,
    pub instance_uuid: Option<String>,
    pub salt: Vec<u8>,
}

impl ServerInfo {
    /// Parses `(major, minor, patch)` out of the version string, e.g. `2.11.1-0-g...`.
    pub fn version_tuple(&self) -> Option<(u32, u32, u32)> {
        let core = self.version.split('-').next()?;
        let mut parts = core.split('.').map(|p| p.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some((major, minor, patch))
    }
}

/// Parses the 128-byte greeting.
pub fn parse_greeting(buf: &[u8]) -> Result<ServerInfo, TntError> {
    if buf.len() < GREETING_SIZE {
        return Err(TntError::Handshake(format!(
            "greeting is {} bytes, expected {GREETING_SIZE}",
            buf.len()
        )));
    }

    let line1 = std::str::from_utf8(&buf[..GREETING_LINE_SIZE])
        .map_err(|_| TntError::Handshake("greeting banner is not valid UTF-8".into()))?;
    let mut words = line1.split_whitespace();
    if words.next() != Some(SERVER_BANNER) {
        return Err(TntError::Handshake(format!(
            "unexpected greeting banner: {:?}",
            line1.trim_end()
        )));
    }
    let version = words
        .next()
        .ok_or_else(|| TntError::Handshake("greeting has no server version".into()))?
        .to_string();
    let protocol = words
        .next()
        .map(|p| p.trim_matches(|c| c == '(' || c == ')').to_string())
        .unwrap_or_else(|| "Binary".to_string());
    if protocol != "Binary" {
        return Err(TntError::Handshake(format!(
            "unsupported protocol '{protocol}'"
        )));
    }
    let instance_uuid = words.next().map(str::to_string);

    let salt_line = &buf[GREETING_LINE_SIZE..GREETING_LINE_SIZE + SALT_BASE64_LEN];
    let salt = base64::engine::general_purpose::STANDARD
        .decode(salt_line)
        .map_err(|e| TntError::Handshake(format!("greeting salt is not valid base64: {e}")))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(TntError::Handshake(format!(
            "greeting salt is too short: {} bytes",
            salt.len()
        )));
    }

    Ok(ServerInfo {
        version,
        protocol,
        instance_uuid,
        salt,
    })
}

/// Computes `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`.
pub fn scramble(salt: &[u8], password: &str) -> Result<[u8; SCRAMBLE_SIZE], TntError> {
    if salt.len() < SCRAMBLE_SIZE {
        return Err(TntError::Handshake("salt too short for scramble".into()));
    }
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ hash3[i];
    }
    Ok(out)
}
