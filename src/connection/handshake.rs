// src/connection/handshake.rs

//! Opening the transport and performing the greeting/auth exchange.

use crate::config::ClientConfig;
use crate::core::TntError;
use crate::core::protocol::greeting::{self, GREETING_SIZE, ServerInfo};
use crate::core::protocol::{Frame, Header, IprotoCodec, Request, Response};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

// Requests sent during the handshake use this sync; the request table never hands it out.
const HANDSHAKE_SYNC: u64 = 0;

/// Opens a TCP connection to the configured endpoint within `connect_timeout`.
pub async fn open_transport(config: &ClientConfig) -> Result<TcpStream, TntError> {
    let addr = config.address();
    debug!("Opening transport to {}", addr);
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            TntError::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )))
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Reads the greeting and authenticates if credentials are configured.
///
/// Returns the server identity and any bytes read past the handshake, which
/// belong to the first frames of the regular stream.
pub async fn perform_handshake(
    stream: &mut TcpStream,
    config: &ClientConfig,
    codec: &mut IprotoCodec,
) -> Result<(ServerInfo, BytesMut), TntError> {
    tokio::time::timeout(config.connect_timeout, handshake_steps(stream, config, codec))
        .await
        .map_err(|_| TntError::Handshake("handshake timed out".into()))?
}

async fn handshake_steps(
    stream: &mut TcpStream,
    config: &ClientConfig,
    codec: &mut IprotoCodec,
) -> Result<(ServerInfo, BytesMut), TntError> {
    // --- Step 1: Greeting ---
    let mut greeting_buf = [0u8; GREETING_SIZE];
    stream.read_exact(&mut greeting_buf).await?;
    let info = greeting::parse_greeting(&greeting_buf)?;
    debug!(
        "Greeting received: Tarantool {} ({})",
        info.version, info.protocol
    );

    let mut leftover = BytesMut::new();

    // --- Step 2: Authentication ---
    if let Some(user) = &config.username {
        let password = config.password.as_deref().unwrap_or("");
        let scramble = greeting::scramble(&info.salt, password)?;
        let request = Request::Auth {
            user: user.clone(),
            scramble: scramble.to_vec(),
        };
        let frame = Frame::new(
            Header::new(request.code(), HANDSHAKE_SYNC),
            request.encode_body()?,
        );

        let mut write_buf = BytesMut::new();
        codec.encode(frame, &mut write_buf)?;
        stream.write_all(&write_buf).await?;

        let reply = loop {
            if let Some(frame) = codec.decode(&mut leftover)? {
                break frame;
            }
            if stream.read_buf(&mut leftover).await? == 0 {
                return Err(TntError::Handshake(
                    "connection closed during authentication".into(),
                ));
            }
        };

        let response = Response::from_frame(&reply)?;
        if response.sync != HANDSHAKE_SYNC {
            return Err(TntError::Handshake(format!(
                "unexpected sync {} in auth reply",
                response.sync
            )));
        }
        response.into_result()?;
        info!("Authenticated as '{}'", user);
    }

    Ok((info, leftover))
}
