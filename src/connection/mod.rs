// src/connection/mod.rs

//! The client connection: a cheaply clonable handle over one multiplexed,
//! self-healing IPROTO session.
//!
//! All clones share a single physical connection, a single request table and
//! a single schema cache. A background worker owns the transport and its
//! reconnect loop. Callers only queue whole frames on the current transport's
//! writer task and wait on their own result slot.

mod handshake;
mod ops;
mod options;
mod state;
mod stream;
mod worker;

pub use handshake::{open_transport, perform_handshake};
pub use options::{IndexRef, SelectOptions, SpaceRef};
pub use state::{ConnectionState, ConnectionStatus};
pub use stream::ResponseStream;

use crate::config::{ClientConfig, ReconnectingPolicy};
use crate::core::TntError;
use crate::core::multiplexer::{RequestTable, Waiter};
use crate::core::protocol::frame;
use crate::core::protocol::{Header, Request, Response, ServerInfo};
use crate::core::schema::{Schema, SchemaCache};
use crate::core::tasks::TimeoutSweeperTask;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, trace, warn};
use worker::{ConnectionWorker, WriterSlot};

/// State shared between the handles and the background worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) table: Arc<RequestTable>,
    pub(crate) schema: SchemaCache,
    /// Frame queue of the current transport.
    pub(crate) writer: parking_lot::Mutex<Option<WriterSlot>>,
    pub(crate) server_info: parking_lot::RwLock<Option<ServerInfo>>,
    /// Why the most recent connect attempt or session failed.
    pub(crate) last_error: parking_lot::Mutex<Option<TntError>>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) reconnect_requested: Notify,
    /// Epoch of the transport a caller last asked to replace.
    pub(crate) reconnect_epoch: AtomicU64,
    pub(crate) transport_failed: Notify,
    /// Epoch of the transport a writer last saw fail.
    pub(crate) failed_epoch: AtomicU64,
    pub(crate) worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            status_tx,
            table: Arc::new(RequestTable::new()),
            schema: SchemaCache::new(),
            writer: parking_lot::Mutex::new(None),
            server_info: parking_lot::RwLock::new(None),
            last_error: parking_lot::Mutex::new(None),
            shutdown_tx,
            reconnect_requested: Notify::new(),
            reconnect_epoch: AtomicU64::new(0),
            transport_failed: Notify::new(),
            failed_epoch: AtomicU64::new(0),
            worker: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Moves to `next` if the current state allows it. Returns whether the
    /// state changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        self.status_tx.send_if_modified(|status| {
            if status.state == next || !status.state.can_transition_to(next) {
                return false;
            }
            info!("Connection state: {} -> {}", status.state, next);
            status.state = next;
            true
        })
    }

    /// Queues one encoded frame on the transport of `epoch`. Fails with
    /// `NotConnected` if that transport has already been replaced.
    fn write_frame(&self, epoch: u64, frame: Bytes) -> Result<(), TntError> {
        let writer = self.writer.lock();
        match writer.as_ref() {
            Some(slot) if slot.epoch == epoch => slot
                .tx
                .send(frame)
                .map_err(|_| TntError::ConnectionLost),
            _ => Err(TntError::NotConnected),
        }
    }

    /// Whether a worker is serving this connection. A worker that already
    /// published `Closed` is on its way out and does not count.
    fn worker_running(&self) -> bool {
        self.status().state != ConnectionState::Closed
            && self
                .worker
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

/// A multiplexed connection to one Tarantool instance.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection in the `Disconnected` state. Nothing is opened
    /// until [`Connection::connect`] is called.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// Creates a connection and waits for the first connect attempt.
    pub async fn open(config: ClientConfig) -> Result<Self, TntError> {
        let connection = Self::new(config);
        connection.connect().await?;
        Ok(connection)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Starts the background worker if it is not running and waits for the
    /// outcome of the next connect attempt.
    ///
    /// On failure the error of that attempt is returned. With reconnect
    /// enabled the worker keeps trying in the background.
    pub async fn connect(&self) -> Result<(), TntError> {
        let before = {
            let running = self.shared.worker_running();
            let mut worker = self.shared.worker.lock();
            let status = self.shared.status();
            if running {
                if status.state == ConnectionState::Connected {
                    return Ok(());
                }
            } else {
                if status.state == ConnectionState::Closing {
                    return Err(TntError::ConnectionClosed);
                }
                self.shared.transition(ConnectionState::Connecting);
                let sweeper = TimeoutSweeperTask::new(
                    Arc::clone(&self.shared.table),
                    self.shared.config.sweep_interval,
                );
                tokio::spawn(sweeper.run(self.shared.shutdown_tx.subscribe()));
                let connection_worker = ConnectionWorker::new(Arc::clone(&self.shared));
                *worker = Some(tokio::spawn(
                    connection_worker.run(self.shared.shutdown_tx.subscribe()),
                ));
            }
            status.attempts
        };
        self.wait_for_attempt(before).await
    }

    /// Drops the current transport and connects again, without backoff.
    /// Requests pending on the old transport fail with `ConnectionLost`.
    pub async fn reconnect(&self) -> Result<(), TntError> {
        if !self.shared.worker_running() {
            return self.connect().await;
        }
        let status = self.shared.status();
        info!("Forcing reconnect to {}", self.shared.config.address());
        // An attempt already under way yields a fresh transport by itself.
        if status.state == ConnectionState::Connected {
            self.shared
                .reconnect_epoch
                .store(status.epoch, Ordering::Release);
        }
        self.shared.reconnect_requested.notify_one();
        let before = status.attempts;
        self.wait_for_attempt(before).await
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shared.status().state == ConnectionState::Closed {
            return;
        }
        self.shared.transition(ConnectionState::Closing);
        let handle = self.shared.worker.lock().take();
        let _ = self.shared.shutdown_tx.send(());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Connection worker ended abnormally: {e}");
        }
        self.shared.writer.lock().take();
        self.shared.table.fail_all(TntError::ConnectionClosed);
        self.shared.transition(ConnectionState::Closed);
        info!("Connection to {} closed", self.shared.config.address());
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// A receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The identity the server announced in its greeting, once connected.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info.read().clone()
    }

    /// The error that ended the most recent connect attempt or session.
    pub fn last_error(&self) -> Option<TntError> {
        self.shared.last_error.lock().clone()
    }

    /// The cached schema snapshot. May be empty or stale.
    pub fn schema(&self) -> Arc<Schema> {
        self.shared.schema.schema()
    }

    pub fn schema_version(&self) -> u64 {
        self.shared.schema.version()
    }

    /// Reloads the schema now.
    pub async fn refresh_schema(&self) -> Result<Arc<Schema>, TntError> {
        self.shared.schema.refresh(self).await
    }

    /// Number of requests awaiting a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.shared.table.len()
    }

    /// Sends `request` and waits for its terminal response.
    pub async fn request(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, TntError> {
        self.request_until(request, self.deadline_for(timeout)).await
    }

    /// Sends `request` and returns a stream of its push messages followed by
    /// the rows of its terminal response.
    pub async fn request_stream(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream, TntError> {
        self.request_stream_until(request, self.deadline_for(timeout))
            .await
    }

    async fn request_until(
        &self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<Response, TntError> {
        self.send(request, deadline, false).await?.response().await
    }

    async fn request_stream_until(
        &self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<ResponseStream, TntError> {
        let waiter = self.send(request, deadline, true).await?;
        Ok(ResponseStream::new(waiter))
    }

    async fn send(
        &self,
        request: Request,
        deadline: Option<Instant>,
        with_push: bool,
    ) -> Result<Waiter, TntError> {
        let epoch = self.ready_epoch(deadline).await?;
        let body = request.encode_body()?;

        let waiter = self.shared.table.register(deadline, with_push)?;
        let mut buf = BytesMut::with_capacity(body.len() + 32);
        frame::encode(&Header::new(request.code(), waiter.sync()), &body, &mut buf)?;
        trace!("Sending {} sync={}", request.name(), waiter.sync());

        // On failure the waiter is dropped here, which removes it from the table.
        self.shared.write_frame(epoch, buf.freeze())?;
        Ok(waiter)
    }

    /// An explicit timeout wins; otherwise the configured default applies.
    fn deadline_for(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.shared.config.request_timeout)
            .map(|t| Instant::now() + t)
    }

    /// Returns the epoch of a live transport, waiting for one according to
    /// the reconnecting policy.
    async fn ready_epoch(&self, deadline: Option<Instant>) -> Result<u64, TntError> {
        let status = self.shared.status();
        match status.state {
            ConnectionState::Connected => return Ok(status.epoch),
            state if !state.is_transient() => return Err(TntError::NotConnected),
            _ => {}
        }
        if self.shared.config.on_reconnecting == ReconnectingPolicy::FailFast {
            return Err(TntError::NotConnected);
        }

        let limit = deadline.unwrap_or_else(|| Instant::now() + self.shared.config.connect_timeout);
        let mut rx = self.shared.status_tx.subscribe();
        let settled = tokio::time::timeout_at(
            limit,
            rx.wait_for(|s| !s.state.is_transient()),
        )
        .await;
        match settled {
            Ok(Ok(status)) if status.state == ConnectionState::Connected => Ok(status.epoch),
            _ => Err(TntError::NotConnected),
        }
    }

    async fn wait_for_attempt(&self, before: u64) -> Result<(), TntError> {
        let mut rx = self.shared.status_tx.subscribe();
        let status = match rx
            .wait_for(|s| {
                s.attempts > before
                    || matches!(s.state, ConnectionState::Closing | ConnectionState::Closed)
            })
            .await
        {
            Ok(status) => *status,
            Err(_) => return Err(TntError::NotConnected),
        };
        match status.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed if status.attempts <= before => {
                Err(TntError::ConnectionClosed)
            }
            _ => Err(self.last_error().unwrap_or(TntError::NotConnected)),
        }
    }
}
