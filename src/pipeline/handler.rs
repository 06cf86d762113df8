//! Per-message orchestration
//!
//! One handler invocation per bus message: decode, resolve the connection,
//! assemble contexts, build the chain, execute under the message deadline,
//! emit metrics, and classify the outcome for the bus adapter. There is no
//! intra-message concurrency; step ordering is observable.

use super::builder::{ChainBuilder, FunctionFilter};
use super::executor::{check_error, execute_chain, ChainOutcome, StepStatus};
use super::{StepContext, SystemContext};
use crate::error::RotorError;
use crate::metrics;
use crate::model::{EventContext, IngestMessage};
use crate::store::{ConfigStore, KvBinding, SharedKvStore};
use crate::udf::UdfRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminal disposition of one message, consumed by the bus adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Chain completed; ack.
    Ok { events: usize },
    /// Poison or unroutable message; ack with a warning, never retry.
    Drop { reason: String },
    /// Non-transient failure; ack with a recorded failure.
    Failed { reason: String },
    /// Transient failure; redeliver with an incremented retry count.
    Retry { reason: String },
}

/// Top-level per-message handler shared by all bus partitions.
pub struct MessageHandler {
    config_store: Arc<ConfigStore>,
    udf_registry: Arc<UdfRegistry>,
    builder: ChainBuilder,
    kv_store: Arc<dyn SharedKvStore>,
    system: Arc<SystemContext>,
    message_deadline: Duration,
}

impl MessageHandler {
    pub fn new(
        config_store: Arc<ConfigStore>,
        udf_registry: Arc<UdfRegistry>,
        builder: ChainBuilder,
        kv_store: Arc<dyn SharedKvStore>,
        message_deadline: Duration,
    ) -> Self {
        Self {
            config_store,
            udf_registry,
            builder,
            kv_store,
            system: Arc::new(SystemContext::new()),
            message_deadline,
        }
    }

    /// Process one raw bus payload.
    pub async fn handle(&self, raw: &[u8], retries: u32) -> MessageOutcome {
        self.handle_filtered(raw, retries, None).await
    }

    /// Process one payload with a function filter (dry-run / debugging).
    pub async fn handle_filtered(
        &self,
        raw: &[u8],
        retries: u32,
        filter: Option<FunctionFilter>,
    ) -> MessageOutcome {
        let message = match IngestMessage::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable message");
                metrics::record_message("unknown", "drop");
                return MessageOutcome::Drop {
                    reason: err.to_string(),
                };
            }
        };

        let connection = match self
            .config_store
            .get_enriched_connection(&message.connection_id)
            .await
        {
            Ok(connection) => connection,
            Err(err @ RotorError::UnknownConnection(_)) => {
                warn!(
                    connection = %message.connection_id,
                    message_id = %message.message_id,
                    "dropping message for unknown connection"
                );
                metrics::record_message("unknown", "drop");
                return MessageOutcome::Drop {
                    reason: err.to_string(),
                };
            }
            Err(err) if err.is_retryable() => {
                return MessageOutcome::Retry {
                    reason: err.to_string(),
                };
            }
            Err(err) => {
                metrics::record_message("unknown", "failed");
                return MessageOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let workspace = connection.workspace_id.clone();
        let ctx = StepContext {
            event_context: EventContext::assemble(&message, &connection, retries),
            connection: connection.clone(),
            store: KvBinding::new(connection.id.clone(), self.kv_store.clone()),
            system: Some(self.system.clone()),
        };

        let outcome = tokio::time::timeout(self.message_deadline, async {
            let chain = self.builder.build(&connection, filter).await?;
            Ok::<_, RotorError>(execute_chain(&chain, message.http_payload.clone(), &ctx).await)
        })
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) if err.is_retryable() => {
                metrics::record_message(&workspace, "retry");
                return MessageOutcome::Retry {
                    reason: err.to_string(),
                };
            }
            Ok(Err(err)) => {
                warn!(
                    connection = %connection.id,
                    message_id = %message.message_id,
                    error = %err,
                    "chain build failed"
                );
                metrics::record_message(&workspace, "failed");
                return MessageOutcome::Failed {
                    reason: err.to_string(),
                };
            }
            Err(_) => {
                let err = RotorError::Timeout(self.message_deadline.as_millis() as u64);
                warn!(
                    connection = %connection.id,
                    message_id = %message.message_id,
                    "message deadline exceeded"
                );
                metrics::record_message(&workspace, "retry");
                return MessageOutcome::Retry {
                    reason: err.to_string(),
                };
            }
        };

        for entry in &result.log {
            let status = match entry.status {
                StepStatus::Ok => "ok",
                StepStatus::Drop => "drop",
                StepStatus::Error => "error",
            };
            metrics::record_step(&entry.step_id, status, entry.duration_ms);
            debug!(
                workspace = %workspace,
                message_id = %message.message_id,
                step = %entry.step_id,
                status,
                duration_ms = entry.duration_ms,
                events_out = entry.events_out,
                "step executed"
            );
        }
        metrics::set_udf_cache_entries(self.udf_registry.len());

        match check_error(&result.log) {
            ChainOutcome::Success => {
                metrics::record_message(&workspace, "ok");
                metrics::record_events_delivered(result.events.len());
                info!(
                    workspace = %workspace,
                    message_id = %message.message_id,
                    events = result.events.len(),
                    "message processed"
                );
                MessageOutcome::Ok {
                    events: result.events.len(),
                }
            }
            ChainOutcome::Retryable(reason) => {
                metrics::record_message(&workspace, "retry");
                MessageOutcome::Retry { reason }
            }
            ChainOutcome::Fatal(reason) => {
                warn!(
                    workspace = %workspace,
                    message_id = %message.message_id,
                    reason = %reason,
                    "message failed, acking to avoid a poison loop"
                );
                metrics::record_message(&workspace, "failed");
                MessageOutcome::Failed { reason }
            }
        }
    }
}
