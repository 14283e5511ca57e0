// src/connection/worker.rs

//! The per-connection supervisor task.
//!
//! The worker owns the lifecycle of the physical connection. It opens the
//! transport, performs the handshake, then runs the single read loop that
//! feeds every inbound frame to the request table and the schema cache. When
//! the transport fails it discards it, fails every pending request with
//! `ConnectionLost`, and reconnects with capped exponential backoff and
//! jitter. Requests that were in flight are never replayed.

use super::Shared;
use super::handshake;
use super::state::ConnectionState;
use crate::core::TntError;
use crate::core::protocol::{IprotoCodec, Response};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

type FrameReader = FramedRead<OwnedReadHalf, IprotoCodec>;

/// The write side of the current physical connection. Frames queued on `tx`
/// are written whole and in order by that transport's writer task.
#[derive(Debug)]
pub(crate) struct WriterSlot {
    pub(crate) epoch: u64,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
}

/// Why a connected session ended.
enum SessionEnd {
    Failed(TntError),
    ReconnectRequested,
    Shutdown,
}

pub(crate) struct ConnectionWorker {
    shared: Arc<Shared>,
}

impl ConnectionWorker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The main run loop: connect, serve, tear down, back off, repeat.
    pub(crate) async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let reconnect = self.shared.config.reconnect.clone();
        let addr = self.shared.config.address();
        let mut current_delay = reconnect.initial_delay;
        info!("Connection worker started for {}", addr);

        loop {
            self.shared.transition(ConnectionState::Connecting);

            let attempt = tokio::select! {
                result = self.establish() => result,
                _ = shutdown_rx.recv() => {
                    self.finish_close().await;
                    return;
                }
            };

            let mut forced = false;
            match attempt {
                Ok((reader, epoch)) => {
                    current_delay = reconnect.initial_delay;
                    match self.serve(reader, epoch, &mut shutdown_rx).await {
                        SessionEnd::Shutdown => {
                            self.finish_close().await;
                            return;
                        }
                        SessionEnd::ReconnectRequested => {
                            info!("Reconnect requested. Dropping connection to {}.", addr);
                            forced = true;
                        }
                        SessionEnd::Failed(e) => {
                            warn!("Connection to {} lost: {e}", addr);
                            *self.shared.last_error.lock() = Some(e);
                        }
                    }
                    self.teardown(TntError::ConnectionLost).await;
                }
                Err(e) => {
                    warn!("Connection attempt to {} failed: {e}", addr);
                    if !reconnect.enabled {
                        info!("Reconnect is disabled. Closing connection to {}.", addr);
                        self.stop_sweeper();
                        self.record_failed_attempt(e, true);
                        return;
                    }
                    self.record_failed_attempt(e, false);
                }
            }

            if !forced && !reconnect.enabled {
                info!("Reconnect is disabled. Closing connection to {}.", addr);
                self.stop_sweeper();
                self.shared.transition(ConnectionState::Closed);
                return;
            }

            self.shared.transition(ConnectionState::Reconnecting);
            if forced {
                continue;
            }

            let jitter = jitter_up_to(reconnect.jitter);
            let wait_time = current_delay + jitter;
            info!("Will try to reconnect to {} in {wait_time:?}", addr);

            tokio::select! {
                _ = tokio::time::sleep(wait_time) => {}
                _ = self.shared.reconnect_requested.notified() => {
                    info!("Reconnect requested during backoff. Reconnecting immediately.");
                }
                _ = shutdown_rx.recv() => {
                    self.finish_close().await;
                    return;
                }
            }

            current_delay = (current_delay * 2).min(reconnect.max_delay);
        }
    }

    /// Opens the transport and performs the handshake. On success the write
    /// half is installed and the state becomes `Connected`.
    async fn establish(&self) -> Result<(FrameReader, u64), TntError> {
        let config = &self.shared.config;
        let mut stream = handshake::open_transport(config).await?;

        self.shared.transition(ConnectionState::Handshaking);
        let mut codec = IprotoCodec::new(config.max_frame_size);
        let (info, leftover) = handshake::perform_handshake(&mut stream, config, &mut codec).await?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec);
        reader.read_buffer_mut().extend_from_slice(&leftover);

        let epoch = self.shared.status().epoch + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(Arc::clone(&self.shared), epoch, write_half, rx));
        *self.shared.writer.lock() = Some(WriterSlot { epoch, tx });
        info!(
            "Connected to {} (Tarantool {}, {})",
            config.address(),
            info.version,
            info.instance_uuid.as_deref().unwrap_or("unknown instance")
        );
        *self.shared.server_info.write() = Some(info);
        self.shared.schema.invalidate();

        self.shared.status_tx.send_modify(|status| {
            status.attempts += 1;
            if status.state.can_transition_to(ConnectionState::Connected) {
                status.state = ConnectionState::Connected;
                status.epoch = epoch;
            }
        });
        Ok((reader, epoch))
    }

    /// Runs the read loop until the session ends for any reason.
    async fn serve(
        &self,
        reader: FrameReader,
        epoch: u64,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        tokio::select! {
            reason = self.read_loop(reader) => SessionEnd::Failed(reason),
            _ = self.transport_failure(epoch) => SessionEnd::Failed(TntError::ConnectionLost),
            _ = self.reconnect_request(epoch) => SessionEnd::ReconnectRequested,
            _ = shutdown_rx.recv() => SessionEnd::Shutdown,
        }
    }

    /// Decodes frames and dispatches them until the transport fails. Returns
    /// the failure that ended the loop.
    async fn read_loop(&self, mut reader: FrameReader) -> TntError {
        while let Some(item) = reader.next().await {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to decode frame: {e}. Dropping connection.");
                    return e;
                }
            };
            match Response::from_frame(&frame) {
                Ok(response) => {
                    self.shared.schema.observe(response.schema_version);
                    self.shared.table.dispatch(response);
                }
                Err(e) if e.is_fatal_to_connection() => {
                    error!(
                        "Malformed response for sync={}: {e}. Dropping connection.",
                        frame.header.sync
                    );
                    return e;
                }
                Err(e) => {
                    warn!("Undecodable response for sync={}: {e}", frame.header.sync);
                    self.shared.schema.observe(frame.header.schema_version);
                    self.shared.table.resolve(frame.header.sync, Err(e));
                }
            }
        }
        debug!("Server closed the connection.");
        TntError::ConnectionLost
    }

    /// Resolves once a writer reports a failure on the transport of `epoch`.
    async fn transport_failure(&self, epoch: u64) {
        loop {
            if self.shared.failed_epoch.load(Ordering::Acquire) == epoch {
                return;
            }
            self.shared.transport_failed.notified().await;
        }
    }

    /// Resolves once a caller asks to replace the transport of `epoch`.
    /// Requests aimed at an earlier transport are ignored.
    async fn reconnect_request(&self, epoch: u64) {
        loop {
            if self.shared.reconnect_epoch.load(Ordering::Acquire) == epoch {
                return;
            }
            self.shared.reconnect_requested.notified().await;
        }
    }

    /// Discards the transport and fails every pending request with `reason`.
    async fn teardown(&self, reason: TntError) {
        // Dropping the sender lets the writer task flush and shut the transport down.
        self.shared.writer.lock().take();
        let failed = self.shared.table.fail_all(reason.clone());
        if failed > 0 {
            warn!("Resolved {} pending requests with: {}", failed, reason);
        }
        self.shared.schema.invalidate();
    }

    async fn finish_close(&self) {
        info!("Connection worker shutting down.");
        self.teardown(TntError::ConnectionClosed).await;
        self.shared.transition(ConnectionState::Closed);
    }

    // Must run before `Closed` is published: a later `connect()` subscribes a
    // new sweeper to the same channel.
    fn stop_sweeper(&self) {
        let _ = self.shared.shutdown_tx.send(());
    }

    /// Publishes a failed attempt. With `give_up` the connection is closed in
    /// the same update, so a caller woken by the attempt sees the final state.
    fn record_failed_attempt(&self, error: TntError, give_up: bool) {
        *self.shared.last_error.lock() = Some(error);
        self.shared.status_tx.send_modify(|status| {
            status.attempts += 1;
            if give_up && status.state.can_transition_to(ConnectionState::Closed) {
                info!("Connection state: {} -> {}", status.state, ConnectionState::Closed);
                status.state = ConnectionState::Closed;
            }
        });
    }
}

/// Writes queued frames until the queue is closed or the transport fails.
async fn write_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            warn!("Write to {} failed: {e}", shared.config.address());
            shared.failed_epoch.store(epoch, Ordering::Release);
            shared.transport_failed.notify_one();
            return;
        }
    }
    if let Err(e) = half.shutdown().await {
        debug!("Error while shutting down transport: {e}");
    }
}

fn jitter_up_to(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
