// src/core/multiplexer/waiter.rs

//! The caller's side of a pending request.

use super::RequestTable;
use crate::core::TntError;
use crate::core::protocol::Response;
use rmpv::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// A handle to one pending request.
///
/// The handle arms a timer at the request's deadline; when it fires it runs
/// the table's `expire` sweep, so the timeout is reported no earlier than the
/// deadline even if the background sweep has not run yet. A request without a
/// deadline arms no timer. Dropping an unfinished handle cancels the request
/// locally.
#[derive(Debug)]
pub struct Waiter {
    sync: u64,
    deadline: Option<Instant>,
    result_rx: oneshot::Receiver<Result<Response, TntError>>,
    push_rx: Option<mpsc::UnboundedReceiver<Value>>,
    table: Arc<RequestTable>,
    finished: bool,
}

impl Waiter {
    pub(super) fn new(
        sync: u64,
        deadline: Option<Instant>,
        result_rx: oneshot::Receiver<Result<Response, TntError>>,
        push_rx: Option<mpsc::UnboundedReceiver<Value>>,
        table: Arc<RequestTable>,
    ) -> Self {
        Self {
            sync,
            deadline,
            result_rx,
            push_rx,
            table,
            finished: false,
        }
    }

    pub fn sync(&self) -> u64 {
        self.sync
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves this request locally with `error`, e.g. when its frame could
    /// not be written. No-op if it was already resolved.
    pub fn fail(&self, error: TntError) {
        self.table.resolve(self.sync, Err(error));
    }

    /// Waits for the next push value. Returns `None` once the request has
    /// been resolved and all push values received before that were consumed.
    pub async fn next_push(&mut self) -> Option<Value> {
        let deadline = self.deadline;
        let rx = self.push_rx.as_mut()?;
        tokio::select! {
            biased;
            value = rx.recv() => value,
            _ = sleep_until_deadline(deadline) => {
                self.table.expire(Instant::now());
                rx.recv().await
            }
        }
    }

    /// Waits for the terminal result.
    pub async fn response(mut self) -> Result<Response, TntError> {
        let outcome = tokio::select! {
            biased;
            result = &mut self.result_rx => result,
            _ = sleep_until_deadline(self.deadline) => {
                self.table.expire(Instant::now());
                (&mut self.result_rx).await
            }
        };
        self.finished = true;
        // A dropped sender without a value only happens if the table itself went away.
        outcome.unwrap_or(Err(TntError::ConnectionLost))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.finished {
            self.table.cancel(self.sync);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
