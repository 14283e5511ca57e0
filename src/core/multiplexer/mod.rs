// src/core/multiplexer/mod.rs

//! The table of in-flight requests.
//!
//! Every request sent on the connection owns exactly one entry, keyed by its
//! correlation id (`sync`). An entry leaves the table in exactly one way:
//! resolved by a terminal response, cancelled by its caller, expired by the
//! timeout sweep, or failed when the connection goes away. Whoever removes
//! the entry owns its result slot, so a request can never be resolved twice.

pub mod waiter;

pub use waiter::Waiter;

use crate::core::TntError;
use crate::core::protocol::{Response, ResponseKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rmpv::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Correlation ids wrap back to 1 after this value.
pub const DEFAULT_SYNC_LIMIT: u64 = u32::MAX as u64;

pub type ResultSender = oneshot::Sender<Result<Response, TntError>>;
pub type PushSender = mpsc::UnboundedSender<Value>;

/// One outstanding call.
#[derive(Debug)]
pub struct PendingRequest {
    deadline: Option<Instant>,
    result_tx: ResultSender,
    push_tx: Option<PushSender>,
}

impl PendingRequest {
    fn complete(self, result: Result<Response, TntError>) {
        // The receiver is gone if the caller stopped waiting; nothing to do then.
        let _ = self.result_tx.send(result);
    }
}

/// Owns the waiter table and allocates correlation ids.
#[derive(Debug)]
pub struct RequestTable {
    pending: DashMap<u64, PendingRequest>,
    last_sync: AtomicU64,
    sync_limit: u64,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self::with_sync_limit(DEFAULT_SYNC_LIMIT)
    }

    /// Creates a table whose ids wrap after `sync_limit`.
    pub fn with_sync_limit(sync_limit: u64) -> Self {
        Self {
            pending: DashMap::new(),
            last_sync: AtomicU64::new(0),
            sync_limit: sync_limit.max(1),
        }
    }

    /// Registers a new pending request and returns the caller's handle.
    ///
    /// The id is never one that is still pending. With `with_push` the
    /// handle also receives push values delivered before the terminal reply.
    pub fn register(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        with_push: bool,
    ) -> Result<Waiter, TntError> {
        let (result_tx, result_rx) = oneshot::channel();
        let (push_tx, push_rx) = if with_push {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut request = Some(PendingRequest {
            deadline,
            result_tx,
            push_tx,
        });

        for _ in 0..self.sync_limit {
            let sync = self.next_sync();
            if let Entry::Vacant(slot) = self.pending.entry(sync) {
                if let Some(request) = request.take() {
                    slot.insert(request);
                }
                trace!("Registered request sync={sync}");
                return Ok(Waiter::new(
                    sync,
                    deadline,
                    result_rx,
                    push_rx,
                    Arc::clone(self),
                ));
            }
        }
        Err(TntError::Protocol(format!(
            "all {} correlation ids are in use",
            self.sync_limit
        )))
    }

    fn next_sync(&self) -> u64 {
        let limit = self.sync_limit;
        let advance = |cur: u64| if cur >= limit { 1 } else { cur + 1 };
        let prev = self
            .last_sync
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(advance(cur)))
            .unwrap_or_else(|cur| cur);
        advance(prev)
    }

    /// Routes a decoded response: push values go to the request's push
    /// sequence, everything else resolves it. Responses for ids nobody is
    /// waiting for are dropped.
    pub fn dispatch(&self, response: Response) {
        let sync = response.sync;
        match response.kind {
            ResponseKind::Push { data } => {
                if !self.push(sync, data) {
                    debug!("Dropping push for sync={sync}: no iterator is waiting for it");
                }
            }
            _ => {
                if !self.resolve(sync, response.into_result()) {
                    debug!("Dropping response for sync={sync}: request is no longer pending");
                }
            }
        }
    }

    /// Resolves the request with a terminal result. Returns false if no
    /// request with that id is pending.
    pub fn resolve(&self, sync: u64, result: Result<Response, TntError>) -> bool {
        match self.pending.remove(&sync) {
            Some((_, request)) => {
                request.complete(result);
                true
            }
            None => false,
        }
    }

    /// Appends a push value to the request's sequence without resolving it.
    pub fn push(&self, sync: u64, value: Value) -> bool {
        match self.pending.get(&sync) {
            Some(request) => match &request.push_tx {
                Some(tx) => tx.send(value).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    /// Stops waiting for the request. Work already sent to the server is not undone.
    pub fn cancel(&self, sync: u64) -> bool {
        let removed = self.pending.remove(&sync).is_some();
        if removed {
            trace!("Cancelled request sync={sync}");
        }
        removed
    }

    /// Resolves every request whose deadline is at or before `now` with
    /// `TntError::Timeout`. Returns the number of expired requests.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline.is_some_and(|d| d <= now))
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for sync in expired {
            if let Some((_, request)) = self
                .pending
                .remove_if(&sync, |_, r| r.deadline.is_some_and(|d| d <= now))
            {
                debug!("Request sync={sync} timed out");
                request.complete(Err(TntError::Timeout));
                count += 1;
            }
        }
        count
    }

    /// Resolves every pending request with `error`. Used when the connection
    /// is lost or closed.
    pub fn fail_all(&self, error: TntError) -> usize {
        let syncs: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for sync in syncs {
            if let Some((_, request)) = self.pending.remove(&sync) {
                request.complete(Err(error.clone()));
                count += 1;
            }
        }
        count
    }

    pub fn is_pending(&self, sync: u64) -> bool {
        self.pending.contains_key(&sync)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
