// src/core/schema/cache.rs

//! Schema-version-aware name resolution.

use super::Schema;
use crate::core::TntError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Something that can load a fresh schema snapshot from the server.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch_schema(&self) -> Result<Schema, TntError>;
}

/// Outcome of the most recent refresh, shared with callers that waited on it.
#[derive(Debug, Default)]
struct RefreshState {
    last_error: Option<TntError>,
}

/// Caches the current schema snapshot and refreshes it when stale.
#[derive(Debug)]
pub struct SchemaCache {
    current: RwLock<Arc<Schema>>,
    stale: AtomicBool,
    /// Highest schema version reported by any response.
    latest_seen: AtomicU64,
    /// Incremented each time a refresh completes, successfully or not.
    generation: AtomicU64,
    refresh_lock: Mutex<RefreshState>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    /// Creates an empty cache. It starts stale so the first lookup loads it.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Schema::default())),
            stale: AtomicBool::new(true),
            latest_seen: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(RefreshState::default()),
        }
    }

    /// The current snapshot.
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Marks the cache stale without waiting for a newer version, e.g. after
    /// a reconnect to a server that may have been restarted.
    ///
    /// Versions observed so far are forgotten: a restarted or different
    /// instance may report a lower version than the previous one.
    pub fn invalidate(&self) {
        self.latest_seen.store(0, Ordering::Release);
        self.stale.store(true, Ordering::Release);
    }

    /// Records the schema version carried by a response. A version newer
    /// than the cached one marks the cache stale. `0` means "not reported".
    pub fn observe(&self, schema_version: u64) {
        if schema_version == 0 {
            return;
        }
        self.latest_seen.fetch_max(schema_version, Ordering::AcqRel);
        if schema_version > self.version() && !self.stale.swap(true, Ordering::AcqRel) {
            debug!(
                "Schema version {} is newer than cached {}; cache marked stale",
                schema_version,
                self.version()
            );
        }
    }

    /// Replaces the whole snapshot at once.
    pub fn install(&self, schema: Schema) {
        let version = schema.version();
        *self.current.write() = Arc::new(schema);
        let still_stale = self.latest_seen.load(Ordering::Acquire) > version;
        self.stale.store(still_stale, Ordering::Release);
    }

    /// Loads a new snapshot from `source`. Concurrent callers collapse into
    /// one fetch: whoever waited on the lock while another refresh completed
    /// shares that refresh's outcome instead of starting a new one.
    pub async fn refresh(&self, source: &dyn SchemaSource) -> Result<Arc<Schema>, TntError> {
        let seen_generation = self.generation.load(Ordering::Acquire);
        self.refresh_since(source, seen_generation).await
    }

    /// Refreshes unless a refresh completed after `seen_generation` was read.
    async fn refresh_since(
        &self,
        source: &dyn SchemaSource,
        seen_generation: u64,
    ) -> Result<Arc<Schema>, TntError> {
        let mut state = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != seen_generation {
            return match &state.last_error {
                Some(e) => Err(e.clone()),
                None => Ok(self.schema()),
            };
        }

        let outcome = source.fetch_schema().await;
        let result = match outcome {
            Ok(schema) => {
                info!(
                    "Schema loaded: version {}, {} spaces",
                    schema.version(),
                    schema.len()
                );
                self.install(schema);
                state.last_error = None;
                Ok(self.schema())
            }
            Err(e) => {
                warn!("Schema refresh failed: {e}");
                state.last_error = Some(e.clone());
                Err(e)
            }
        };
        // Published after the install so that a reader who sees the new
        // generation also sees the fresh snapshot.
        self.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Resolves a space name to its id. A stale cache is refreshed first; a
    /// miss on a fresh cache triggers exactly one more refresh.
    pub async fn resolve_space(
        &self,
        source: &dyn SchemaSource,
        name: &str,
    ) -> Result<u32, TntError> {
        let mut seen_generation = self.generation.load(Ordering::Acquire);
        let mut refreshed = false;
        if self.is_stale() {
            self.refresh_since(source, seen_generation).await?;
            seen_generation = self.generation.load(Ordering::Acquire);
            refreshed = true;
        }
        if let Some(space) = self.schema().space(name) {
            return Ok(space.id);
        }
        if !refreshed
            && let Some(space) = self.refresh_since(source, seen_generation).await?.space(name)
        {
            return Ok(space.id);
        }
        Err(TntError::UnknownSpace(name.to_string()))
    }

    /// Resolves an index name within a space to its id, with the same
    /// refresh policy as `resolve_space`.
    pub async fn resolve_index(
        &self,
        source: &dyn SchemaSource,
        space_id: u32,
        name: &str,
    ) -> Result<u32, TntError> {
        let mut seen_generation = self.generation.load(Ordering::Acquire);
        let mut refreshed = false;
        if self.is_stale() {
            self.refresh_since(source, seen_generation).await?;
            seen_generation = self.generation.load(Ordering::Acquire);
            refreshed = true;
        }
        let lookup = |schema: &Schema| {
            schema
                .space_by_id(space_id)
                .and_then(|space| space.index(name))
                .map(|index| index.id)
        };
        if let Some(id) = lookup(self.schema().as_ref()) {
            return Ok(id);
        }
        if !refreshed {
            let schema = self.refresh_since(source, seen_generation).await?;
            if let Some(id) = lookup(schema.as_ref()) {
                return Ok(id);
            }
        }

        let schema = self.schema();
        let space = schema
            .space_by_id(space_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| space_id.to_string());
        Err(TntError::UnknownIndex {
            space,
            index: name.to_string(),
        })
    }
}
