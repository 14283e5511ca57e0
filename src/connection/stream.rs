// src/connection/stream.rs

//! Iterating over a call that produces push messages before its final reply.

use crate::core::TntError;
use crate::core::multiplexer::Waiter;
use futures::{Stream, StreamExt, TryStreamExt};
use rmpv::Value;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The values produced by one request, in arrival order.
///
/// Push messages are yielded first, as they arrive. Once the terminal reply
/// is received its rows are yielded and the stream ends. A terminal error is
/// yielded once as the last item. Dropping the stream cancels the request.
pub struct ResponseStream {
    sync: u64,
    inner: Pin<Box<dyn Stream<Item = Result<Value, TntError>> + Send>>,
}

impl ResponseStream {
    pub(crate) fn new(mut waiter: Waiter) -> Self {
        let sync = waiter.sync();
        let inner = async_stream::try_stream! {
            while let Some(data) = waiter.next_push().await {
                for value in flatten(data) {
                    yield value;
                }
            }
            let response = waiter.response().await?;
            for row in response.into_rows() {
                yield row;
            }
        };
        Self {
            sync,
            inner: Box::pin(inner),
        }
    }

    /// The correlation id of the underlying request.
    pub fn sync(&self) -> u64 {
        self.sync
    }

    /// Drains the stream into a vector, stopping at the first error.
    pub async fn collect_rows(self) -> Result<Vec<Value>, TntError> {
        self.try_collect().await
    }

    /// Like `next()` but usable without importing `StreamExt`.
    pub async fn next_value(&mut self) -> Option<Result<Value, TntError>> {
        self.next().await
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value, TntError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

// Push payloads arrive as a DATA array; each element is one pushed value.
fn flatten(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Nil => Vec::new(),
        other => vec![other],
    }
}
