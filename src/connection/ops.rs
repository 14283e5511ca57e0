// src/connection/ops.rs

//! The call-shaped operations of a connection.

use super::{Connection, IndexRef, ResponseStream, SelectOptions, SpaceRef};
use crate::core::TntError;
use crate::core::protocol::constants::{VINDEX_ID, VSPACE_ID};
use crate::core::protocol::{IteratorKind, Request, Response};
use crate::core::schema::{Schema, SchemaSource};
use async_trait::async_trait;
use rmpv::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// How many times the catalog is re-read when it changes between the two selects.
const SCHEMA_LOAD_ATTEMPTS: usize = 3;

/// Runs `fut` against the call deadline, if there is one.
async fn within<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T, TntError>>,
) -> Result<T, TntError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TntError::Timeout)?,
        None => fut.await,
    }
}

impl Connection {
    /// Round-trips an empty request.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Response, TntError> {
        self.request(Request::Ping, timeout).await
    }

    /// Calls a stored function. The return values are the response rows.
    pub async fn call(
        &self,
        function: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, TntError> {
        let request = Request::Call {
            function: function.to_string(),
            args,
        };
        self.request(request, timeout).await
    }

    /// Calls a stored function that may push values before returning.
    pub async fn call_stream(
        &self,
        function: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream, TntError> {
        let request = Request::Call {
            function: function.to_string(),
            args,
        };
        self.request_stream(request, timeout).await
    }

    /// Evaluates a Lua expression on the server.
    pub async fn eval(
        &self,
        expression: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, TntError> {
        let request = Request::Eval {
            expression: expression.to_string(),
            args,
        };
        self.request(request, timeout).await
    }

    /// Scans an index. The stream yields any pushed values, then the tuples
    /// of the terminal response.
    pub async fn select(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        options: SelectOptions,
    ) -> Result<ResponseStream, TntError> {
        let deadline = self.deadline_for(options.timeout);
        let (space_id, index_id) =
            within(deadline, self.resolve_pair(space.into(), index.into())).await?;
        let request = Request::Select {
            space_id,
            index_id,
            key,
            iterator: options.iterator,
            limit: options.limit,
            offset: options.offset,
        };
        self.request_stream_until(request, deadline).await
    }

    /// Inserts a tuple and returns the stored tuple.
    pub async fn insert(
        &self,
        space: impl Into<SpaceRef>,
        tuple: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, TntError> {
        let deadline = self.deadline_for(timeout);
        let space_id = within(deadline, self.resolve_space(space.into())).await?;
        let response = self
            .request_until(Request::Insert { space_id, tuple }, deadline)
            .await?;
        Ok(response.into_rows())
    }

    /// Inserts or replaces a tuple by primary key.
    pub async fn replace(
        &self,
        space: impl Into<SpaceRef>,
        tuple: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, TntError> {
        let deadline = self.deadline_for(timeout);
        let space_id = within(deadline, self.resolve_space(space.into())).await?;
        let response = self
            .request_until(Request::Replace { space_id, tuple }, deadline)
            .await?;
        Ok(response.into_rows())
    }

    /// Deletes by key on a unique index. Returns the deleted tuple, if any.
    pub async fn delete(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, TntError> {
        let deadline = self.deadline_for(timeout);
        let (space_id, index_id) =
            within(deadline, self.resolve_pair(space.into(), index.into())).await?;
        let request = Request::Delete {
            space_id,
            index_id,
            key,
        };
        Ok(self.request_until(request, deadline).await?.into_rows())
    }

    /// Applies update operations such as `["=", 1, "value"]` to the tuple with `key`.
    pub async fn update(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        operations: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, TntError> {
        let deadline = self.deadline_for(timeout);
        let (space_id, index_id) =
            within(deadline, self.resolve_pair(space.into(), index.into())).await?;
        let request = Request::Update {
            space_id,
            index_id,
            key,
            operations,
        };
        Ok(self.request_until(request, deadline).await?.into_rows())
    }

    /// Inserts `tuple`, or applies `operations` if a tuple with the same
    /// primary key exists. The server returns no tuple.
    pub async fn upsert(
        &self,
        space: impl Into<SpaceRef>,
        tuple: Vec<Value>,
        operations: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), TntError> {
        let deadline = self.deadline_for(timeout);
        let space_id = within(deadline, self.resolve_space(space.into())).await?;
        let request = Request::Upsert {
            space_id,
            tuple,
            operations,
        };
        self.request_until(request, deadline).await?;
        Ok(())
    }

    async fn resolve_space(&self, space: SpaceRef) -> Result<u32, TntError> {
        match space {
            SpaceRef::Id(id) => Ok(id),
            SpaceRef::Name(name) => self.shared.schema.resolve_space(self, &name).await,
        }
    }

    async fn resolve_pair(&self, space: SpaceRef, index: IndexRef) -> Result<(u32, u32), TntError> {
        let space_id = self.resolve_space(space).await?;
        let index_id = self.resolve_index(space_id, index).await?;
        Ok((space_id, index_id))
    }

    async fn resolve_index(&self, space_id: u32, index: IndexRef) -> Result<u32, TntError> {
        match index {
            IndexRef::Id(id) => Ok(id),
            IndexRef::Name(name) => {
                self.shared
                    .schema
                    .resolve_index(self, space_id, &name)
                    .await
            }
        }
    }

    async fn select_catalog(&self, space_id: u32) -> Result<Response, TntError> {
        let request = Request::Select {
            space_id,
            index_id: 0,
            key: Vec::new(),
            iterator: IteratorKind::All,
            limit: u32::MAX,
            offset: 0,
        };
        self.request(request, None).await
    }
}

#[async_trait]
impl SchemaSource for Connection {
    /// Reads the space and index catalogs. If the schema changes between the
    /// two reads they are re-read, up to a fixed number of attempts.
    async fn fetch_schema(&self) -> Result<Schema, TntError> {
        let mut attempt = 1;
        loop {
            let spaces = self.select_catalog(VSPACE_ID).await?;
            let indexes = self.select_catalog(VINDEX_ID).await?;

            if spaces.schema_version == indexes.schema_version || attempt >= SCHEMA_LOAD_ATTEMPTS {
                let version = indexes.schema_version;
                return Schema::from_catalog(version, &spaces.into_rows(), &indexes.into_rows());
            }
            debug!(
                "Schema changed while loading ({} -> {}), reading the catalog again",
                spaces.schema_version, indexes.schema_version
            );
            attempt += 1;
        }
    }
}
