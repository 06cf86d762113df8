//! Read-through config store client
//!
//! Wraps the external fast-lookup store behind [`ConfigLoader`] and caches
//! positive results for a short TTL. A nil result is never cached: the next
//! event for the same key retries the lookup.

use crate::cache::{Sweep, TtlCache};
use crate::error::{Result, RotorError};
use crate::model::{EnrichedConnection, FunctionDefinition};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// External read path `(kind, key) -> record | nil`.
///
/// Expected to hit a low-latency store. Transport failures are surfaced as
/// retryable; a nil result means the key genuinely does not exist right now.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self, kind: &str, key: &str) -> Result<Option<Value>>;
}

/// HTTP-backed loader for deployments exposing the config store over a
/// REST read path: `GET {base}/api/{kind}/{key}`, 404 meaning nil.
pub struct HttpConfigLoader {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConfigLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ConfigLoader for HttpConfigLoader {
    async fn load(&self, kind: &str, key: &str) -> Result<Option<Value>> {
        let url = format!("{}/api/{kind}/{key}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RotorError::ConfigStore(format!("config store unreachable: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RotorError::ConfigStore(format!(
                "config store returned {} for {kind}/{key}",
                response.status()
            )));
        }
        let record = response
            .json()
            .await
            .map_err(|e| RotorError::ConfigStore(format!("bad config store payload: {e}")))?;
        Ok(Some(record))
    }
}

/// Cached client for enriched connections and function definitions.
pub struct ConfigStore {
    loader: Arc<dyn ConfigLoader>,
    connections: Arc<TtlCache<Arc<EnrichedConnection>>>,
    functions: Arc<TtlCache<Arc<FunctionDefinition>>>,
    connection_ttl: Duration,
    function_ttl: Duration,
}

impl ConfigStore {
    pub fn new(
        loader: Arc<dyn ConfigLoader>,
        connection_ttl: Duration,
        function_ttl: Duration,
    ) -> Self {
        Self {
            loader,
            connections: Arc::new(TtlCache::new("connections")),
            functions: Arc::new(TtlCache::new("functions")),
            connection_ttl,
            function_ttl,
        }
    }

    /// Handles for the background sweeper.
    pub fn sweep_handles(&self) -> Vec<Arc<dyn Sweep>> {
        vec![
            self.connections.clone() as Arc<dyn Sweep>,
            self.functions.clone() as Arc<dyn Sweep>,
        ]
    }

    /// Resolve the enriched connection for a routing key.
    pub async fn get_enriched_connection(&self, id: &str) -> Result<Arc<EnrichedConnection>> {
        if let Some(connection) = self.connections.get(id) {
            return Ok(connection);
        }
        let raw = self
            .loader
            .load("connection", id)
            .await?
            .ok_or_else(|| RotorError::UnknownConnection(id.to_string()))?;
        let connection: EnrichedConnection = serde_json::from_value(raw)
            .map_err(|e| RotorError::ConfigStore(format!("bad connection record '{id}': {e}")))?;
        let connection = Arc::new(connection);
        self.connections
            .set(id, connection.clone(), self.connection_ttl);
        debug!(connection = id, "cached enriched connection");
        Ok(connection)
    }

    /// Resolve a function definition by function id (the `udf.` suffix).
    pub async fn get_function(&self, id: &str) -> Result<Arc<FunctionDefinition>> {
        if let Some(function) = self.functions.get(id) {
            return Ok(function);
        }
        let raw = self
            .loader
            .load("function", id)
            .await?
            .ok_or_else(|| RotorError::UnknownFunction(id.to_string()))?;
        let function: FunctionDefinition = serde_json::from_value(raw)
            .map_err(|e| RotorError::ConfigStore(format!("bad function record '{id}': {e}")))?;
        let function = Arc::new(function);
        self.functions.set(id, function.clone(), self.function_ttl);
        Ok(function)
    }

    /// Drop a cached connection (admin/debug path).
    pub fn invalidate_connection(&self, id: &str) {
        self.connections.delete(id);
    }

    /// Drop a cached function definition so the next build refetches it.
    pub fn invalidate_function(&self, id: &str) {
        self.functions.delete(id);
    }
}
