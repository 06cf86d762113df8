//! Chain executor
//!
//! Runs an ordered step list against an event set. A step maps each event
//! to one event, a fan-out, or a drop; errors are captured into the
//! execution log and never raised out of the executor. The log is the
//! single source for the end-of-chain retry/ack decision.

use super::{ChainStep, StepContext, StepOutput};
use crate::model::AnalyticsEvent;
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

/// Outcome of one step over the whole current event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Drop,
    Error,
}

/// Error captured from a step, with its retryability baked in so the log
/// alone can classify the chain outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub message: String,
    pub retryable: bool,
}

/// Per-step record for metrics and the retry decision.
#[derive(Debug, Clone, Serialize)]
pub struct ExecLogEntry {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub events_in: usize,
    pub events_out: usize,
}

/// Final event set plus the execution log.
#[derive(Debug, Serialize)]
pub struct ChainResult {
    pub events: Vec<AnalyticsEvent>,
    pub log: Vec<ExecLogEntry>,
}

/// Overall chain classification derived from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Success,
    /// A transient failure occurred somewhere; redeliver the message.
    Retryable(String),
    /// Only non-transient failures occurred; ack with a recorded failure.
    Fatal(String),
}

/// Run `steps` in order against `event`.
///
/// The current event set starts as `[event]`. Each step maps every event in
/// the set; outputs accumulate in order. An empty set short-circuits the
/// rest of the chain. A failing event is removed from the set without
/// cancelling its fan-out siblings.
pub async fn execute_chain(
    steps: &[ChainStep],
    event: AnalyticsEvent,
    ctx: &StepContext,
) -> ChainResult {
    let mut current = vec![event];
    let mut log = Vec::with_capacity(steps.len());

    for step in steps {
        if current.is_empty() {
            break;
        }
        let events_in = current.len();
        let started = Instant::now();
        let mut next = Vec::with_capacity(events_in);
        let mut error: Option<StepError> = None;

        for event in current.drain(..) {
            match step.exec.exec(event, ctx, &step.config).await {
                Ok(StepOutput::One(out)) => next.push(out),
                Ok(StepOutput::Many(out)) => next.extend(out),
                Ok(StepOutput::Drop) => {}
                Err(err) => {
                    warn!(step = %step.id, error = %err, "chain step failed");
                    let retryable = err.is_retryable();
                    match &error {
                        // A retryable failure dominates the step record so
                        // the chain outcome prefers redelivery.
                        Some(existing) if existing.retryable || !retryable => {}
                        _ => {
                            error = Some(StepError {
                                message: err.to_string(),
                                retryable,
                            });
                        }
                    }
                }
            }
        }

        let status = if error.is_some() {
            StepStatus::Error
        } else if next.is_empty() {
            StepStatus::Drop
        } else {
            StepStatus::Ok
        };
        log.push(ExecLogEntry {
            step_id: step.id.clone(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            events_in,
            events_out: next.len(),
        });
        current = next;
    }

    ChainResult {
        events: current,
        log,
    }
}

/// Inspect the execution log and classify the chain. Retryable wins over
/// fatal: a message with both is redelivered rather than acked.
pub fn check_error(log: &[ExecLogEntry]) -> ChainOutcome {
    let mut fatal: Option<&ExecLogEntry> = None;
    for entry in log {
        if let Some(error) = &entry.error {
            if error.retryable {
                return ChainOutcome::Retryable(format!(
                    "{}: {}",
                    entry.step_id, error.message
                ));
            }
            fatal.get_or_insert(entry);
        }
    }
    match fatal {
        Some(entry) => ChainOutcome::Fatal(format!(
            "{}: {}",
            entry.step_id,
            entry.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
        )),
        None => ChainOutcome::Success,
    }
}
