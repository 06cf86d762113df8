//! The message-handler pipeline
//!
//! Per-event orchestration: the chain builder turns a connection's
//! configuration into an ordered list of executable steps, the executor
//! runs an event through them with fan-out and drop semantics, and the
//! message handler wraps the whole thing per bus message.
//!
//! Step ordering is fixed at build time: builtin transformations first,
//! then a single synthetic UDF pipeline step, then destinations. The
//! executor performs no reordering of its own.

pub mod builder;
pub mod builtins;
pub mod executor;
pub mod handler;

pub use builder::{ChainBuilder, FunctionFilter};
pub use builtins::BuiltinRegistry;
pub use executor::{execute_chain, check_error, ChainOutcome, ChainResult, ExecLogEntry, StepStatus};
pub use handler::{MessageHandler, MessageOutcome};

use crate::error::Result;
use crate::model::{AnalyticsEvent, EnrichedConnection, EventContext};
use crate::store::KvBinding;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Step class, decided once when the chain is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// `builtin.transformation.*`: pure event mapper.
    Transformation,
    /// The synthetic `udf.PIPELINE` step wrapping all user functions.
    UdfPipeline,
    /// `builtin.destination.*`: terminal delivery.
    Destination,
}

/// What a step produced for one input event.
#[derive(Debug)]
pub enum StepOutput {
    /// Replace the event.
    One(AnalyticsEvent),
    /// Fan out into several events; order is preserved.
    Many(Vec<AnalyticsEvent>),
    /// Remove the event; nothing downstream sees it.
    Drop,
}

/// Platform-internal services available to builtin steps only. User code
/// never sees this handle; UDF steps read the reduced
/// [`crate::model::UdfContext`] instead.
pub struct SystemContext {
    /// Shared HTTP client for downstream delivery.
    pub http: reqwest::Client,
}

impl SystemContext {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Full per-message context threaded through the executor.
pub struct StepContext {
    pub connection: Arc<EnrichedConnection>,
    pub event_context: EventContext,
    pub store: KvBinding,
    /// Present for the outer chain; builtin steps require it, UDF steps
    /// ignore it.
    pub system: Option<Arc<SystemContext>>,
}

/// Executable body of a chain step.
#[async_trait]
pub trait StepExec: Send + Sync {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        config: &Value,
    ) -> Result<StepOutput>;
}

/// One ordered element of a function chain.
#[derive(Clone)]
pub struct ChainStep {
    pub id: String,
    pub kind: StepKind,
    /// Step configuration (function options, bulker settings).
    pub config: Value,
    pub exec: Arc<dyn StepExec>,
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish()
    }
}

impl ChainStep {
    pub fn new(
        id: impl Into<String>,
        kind: StepKind,
        config: Value,
        exec: Arc<dyn StepExec>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            config,
            exec,
        }
    }
}
