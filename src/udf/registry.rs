//! Compiled-UDF cache with content-hash revalidation
//!
//! `acquire` is the only entry point on the hot path: it returns the cached
//! wrapper when the stored hash still matches the current source, and
//! otherwise compiles a fresh sandbox, releasing the stale one. Rebuilds
//! serialize per function id so two concurrent refreshes compile once.

use super::{code_hash, UdfCompiler, UdfWrapper};
use crate::cache::{Sweep, TtlCache};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A compiled sandbox paired with the hash of the source that produced it.
#[derive(Clone)]
pub struct CompiledUdf {
    pub wrapper: Arc<dyn UdfWrapper>,
    pub hash: String,
}

impl std::fmt::Debug for CompiledUdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUdf")
            .field("hash", &self.hash)
            .finish()
    }
}

/// Owns compiled UDF sandboxes keyed by function id.
pub struct UdfRegistry {
    compiler: Arc<dyn UdfCompiler>,
    cache: Arc<TtlCache<CompiledUdf>>,
    rebuild_locks: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl UdfRegistry {
    pub fn new(compiler: Arc<dyn UdfCompiler>, ttl: Duration) -> Self {
        let cache = Arc::new(TtlCache::with_release_hook(
            "udf-wrappers",
            Arc::new(|key: &str, entry: &CompiledUdf| {
                debug!(function = key, "closing evicted udf wrapper");
                entry.wrapper.close();
            }),
        ));
        Self {
            compiler,
            cache,
            rebuild_locks: DashMap::new(),
            ttl,
        }
    }

    /// Return the compiled wrapper for `function_id`, compiling when the
    /// cache is cold or the source changed. The entry's TTL is refreshed on
    /// every successful call.
    pub async fn acquire(&self, function_id: &str, name: &str, code: &str) -> Result<CompiledUdf> {
        let hash = code_hash(code);

        if let Some(entry) = self.cache.get(function_id) {
            if entry.hash == hash {
                self.cache.touch(function_id, self.ttl);
                return Ok(entry);
            }
        }

        let lock = self
            .rebuild_locks
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another handler may have rebuilt while we waited on the lock.
        if let Some(entry) = self.cache.get(function_id) {
            if entry.hash == hash {
                self.cache.touch(function_id, self.ttl);
                return Ok(entry);
            }
        }

        self.compile_and_store(function_id, name, code, hash).await
    }

    /// Force a fresh compile, replacing whatever is cached. Used by the
    /// disposed-sandbox recovery path where the hash is unchanged but the
    /// interpreter behind the wrapper is gone.
    pub async fn recompile(&self, function_id: &str, name: &str, code: &str) -> Result<CompiledUdf> {
        let hash = code_hash(code);
        let lock = self
            .rebuild_locks
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        self.compile_and_store(function_id, name, code, hash).await
    }

    async fn compile_and_store(
        &self,
        function_id: &str,
        name: &str,
        code: &str,
        hash: String,
    ) -> Result<CompiledUdf> {
        info!(function = function_id, name, "compiling udf");
        let wrapper = self.compiler.compile(function_id, name, code).await?;
        let compiled = CompiledUdf { wrapper, hash };
        // set releases the stale entry, which closes its wrapper.
        self.cache
            .set(function_id, compiled.clone(), self.ttl);
        Ok(compiled)
    }

    /// Drop one compiled wrapper, closing it.
    pub fn evict(&self, function_id: &str) -> bool {
        self.cache.delete(function_id).is_some()
    }

    /// Drop every compiled wrapper. Called on shutdown after handlers have
    /// drained; each wrapper's close runs from the release hook.
    pub fn evict_all(&self) -> usize {
        self.rebuild_locks.clear();
        self.cache.evict_all()
    }

    /// Number of live entries (for the operator gauge).
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Handle for the background sweeper.
    pub fn sweep_handle(&self) -> Arc<dyn Sweep> {
        self.cache.clone()
    }
}
