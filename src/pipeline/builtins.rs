//! Builtin functions: platform-provided transformations and destinations
//!
//! Builtins are looked up by the short name after their id prefix
//! (`builtin.transformation.addTimestamp` → `addTimestamp`). A lookup miss
//! at chain-build time is a configuration error for the message.

use super::{StepContext, StepExec, StepOutput};
use crate::error::{Result, RotorError};
use crate::model::AnalyticsEvent;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of builtin steps by short name.
pub struct BuiltinRegistry {
    transformations: HashMap<String, Arc<dyn StepExec>>,
    destinations: HashMap<String, Arc<dyn StepExec>>,
}

impl BuiltinRegistry {
    /// Empty registry; used by tests that inject their own steps.
    pub fn new() -> Self {
        Self {
            transformations: HashMap::new(),
            destinations: HashMap::new(),
        }
    }

    /// The standard production set.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register_transformation("addTimestamp", Arc::new(AddTimestamp));
        registry.register_transformation("maskFields", Arc::new(MaskFields));
        registry.register_destination("bulker", Arc::new(BulkerDestination));
        registry.register_destination("webhook", Arc::new(WebhookDestination));
        registry
    }

    pub fn register_transformation(&mut self, name: impl Into<String>, exec: Arc<dyn StepExec>) {
        self.transformations.insert(name.into(), exec);
    }

    pub fn register_destination(&mut self, name: impl Into<String>, exec: Arc<dyn StepExec>) {
        self.destinations.insert(name.into(), exec);
    }

    pub fn transformation(&self, name: &str) -> Option<Arc<dyn StepExec>> {
        self.transformations.get(name).cloned()
    }

    pub fn destination(&self, name: &str) -> Option<Arc<dyn StepExec>> {
        self.destinations.get(name).cloned()
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Transformations
// ---------------------------------------------------------------------------

/// Stamps `timestamp` (and `receivedAt`) when the event lacks them.
struct AddTimestamp;

#[async_trait]
impl StepExec for AddTimestamp {
    async fn exec(
        &self,
        mut event: AnalyticsEvent,
        _ctx: &StepContext,
        _config: &Value,
    ) -> Result<StepOutput> {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        if event.timestamp.is_none() {
            event.timestamp = Some(now.clone());
        }
        event
            .extra
            .entry("receivedAt".to_string())
            .or_insert_with(|| Value::String(now));
        Ok(StepOutput::One(event))
    }
}

/// Replaces configured property values with `"****"`.
///
/// Config shape: `{"fields": ["email", "phone"]}`.
struct MaskFields;

const MASK: &str = "****";

#[async_trait]
impl StepExec for MaskFields {
    async fn exec(
        &self,
        mut event: AnalyticsEvent,
        _ctx: &StepContext,
        config: &Value,
    ) -> Result<StepOutput> {
        let fields: Vec<&str> = config
            .get("fields")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(properties) = event.properties.as_mut() {
            for field in fields {
                if properties.contains_key(field) {
                    properties.insert(field.to_string(), Value::String(MASK.to_string()));
                }
            }
        }
        Ok(StepOutput::One(event))
    }
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Terminal delivery through the bulker HTTP service.
///
/// Step config is assembled by the chain builder:
/// `{bulkerEndpoint, destinationId, authToken, dataLayout, tableName?}`.
struct BulkerDestination;

#[async_trait]
impl StepExec for BulkerDestination {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        config: &Value,
    ) -> Result<StepOutput> {
        let endpoint = config_str(config, "bulkerEndpoint")?;
        let destination_id = config_str(config, "destinationId")?;
        let auth_token = config_str(config, "authToken")?;
        let data_layout = config
            .get("dataLayout")
            .and_then(Value::as_str)
            .unwrap_or("segment-single-table");
        // Table name falls back to the event tag (track, page, identify…).
        let table_name = config
            .get("tableName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| event.event_type.to_string());

        let url = format!("{endpoint}/post/{destination_id}");
        let system = system_context(ctx)?;
        debug!(destination = destination_id, table = %table_name, "posting to bulker");

        let response = system
            .http
            .post(&url)
            .query(&[("tableName", table_name.as_str()), ("dataLayout", data_layout)])
            .bearer_auth(auth_token)
            .json(&event)
            .send()
            .await
            .map_err(|e| RotorError::Downstream(format!("bulker unreachable: {e}")))?;

        classify_response("bulker", response.status())?;
        Ok(StepOutput::One(event))
    }
}

/// Terminal delivery to a caller-configured HTTP endpoint.
///
/// Reads `url` (required) and `headers` (optional map) from the
/// connection's credentials.
struct WebhookDestination;

#[async_trait]
impl StepExec for WebhookDestination {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        _config: &Value,
    ) -> Result<StepOutput> {
        let url = ctx
            .connection
            .credentials
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RotorError::Config(format!(
                    "webhook destination for connection '{}' has no url credential",
                    ctx.connection.id
                ))
            })?;

        let system = system_context(ctx)?;
        let mut request = system.http.post(url).json(&event);
        if let Some(headers) = ctx
            .connection
            .credentials
            .get("headers")
            .and_then(Value::as_object)
        {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| RotorError::Downstream(format!("webhook unreachable: {e}")))?;
        classify_response("webhook", response.status())?;
        Ok(StepOutput::One(event))
    }
}

fn system_context(ctx: &StepContext) -> Result<&super::SystemContext> {
    ctx.system
        .as_deref()
        .ok_or_else(|| RotorError::Config("system context unavailable to builtin step".into()))
}

fn config_str<'a>(config: &'a Value, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RotorError::Config(format!("missing step config key '{key}'")))
}

/// 5xx and transport failures are retryable; any other non-success status
/// is a configuration problem and fatal for the message.
fn classify_response(target: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(RotorError::Downstream(format!(
            "{target} returned {status}"
        )))
    } else {
        Err(RotorError::Config(format!(
            "{target} rejected the event with {status}"
        )))
    }
}

/// Build the step config for the terminal bulker destination.
pub(crate) fn bulker_step_config(
    bulker_endpoint: &str,
    auth_token: &str,
    connection: &crate::model::EnrichedConnection,
) -> Value {
    let layout = connection
        .options
        .data_layout
        .unwrap_or(crate::model::DataLayout::SegmentSingleTable);
    // The connection id is deliberately passed as the bulker destination id,
    // matching the ingest contract.
    json!({
        "bulkerEndpoint": bulker_endpoint,
        "destinationId": connection.id,
        "authToken": auth_token,
        "dataLayout": layout.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventContext, IngestMessage};
    use crate::store::{InMemoryKvStore, KvBinding};
    use serde_json::json;

    fn test_connection() -> crate::model::EnrichedConnection {
        serde_json::from_value(json!({
            "id": "c1",
            "workspaceId": "w1",
            "streamId": "s1",
            "destinationId": "d1",
            "type": "webhook",
            "mode": "stream",
            "options": {"dataLayout": "segment"}
        }))
        .unwrap()
    }

    fn test_ctx() -> StepContext {
        let connection = Arc::new(test_connection());
        let message = IngestMessage {
            connection_id: "c1".into(),
            message_id: "m1".into(),
            message_type: "track".into(),
            http_payload: serde_json::from_value(json!({"type": "track", "messageId": "m1"}))
                .unwrap(),
            http_headers: None,
            geo: None,
            origin: None,
        };
        StepContext {
            event_context: EventContext::assemble(&message, &connection, 0),
            connection,
            store: KvBinding::new("c1", Arc::new(InMemoryKvStore::new())),
            system: None,
        }
    }

    fn track_event(props: Value) -> AnalyticsEvent {
        serde_json::from_value(json!({
            "type": "track",
            "messageId": "m1",
            "event": "click",
            "properties": props
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_timestamp_fills_missing() {
        let ctx = test_ctx();
        let out = AddTimestamp
            .exec(track_event(json!({})), &ctx, &Value::Null)
            .await
            .unwrap();
        let StepOutput::One(event) = out else {
            panic!("expected single event");
        };
        assert!(event.timestamp.is_some());
        assert!(event.extra.contains_key("receivedAt"));
    }

    #[tokio::test]
    async fn test_add_timestamp_keeps_existing() {
        let ctx = test_ctx();
        let mut event = track_event(json!({}));
        event.timestamp = Some("2024-01-01T00:00:00Z".into());
        let out = AddTimestamp.exec(event, &ctx, &Value::Null).await.unwrap();
        let StepOutput::One(event) = out else {
            panic!("expected single event");
        };
        assert_eq!(event.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_mask_fields() {
        let ctx = test_ctx();
        let config = json!({"fields": ["email"]});
        let out = MaskFields
            .exec(
                track_event(json!({"email": "a@b.c", "plan": "pro"})),
                &ctx,
                &config,
            )
            .await
            .unwrap();
        let StepOutput::One(event) = out else {
            panic!("expected single event");
        };
        let props = event.properties.unwrap();
        assert_eq!(props.get("email"), Some(&json!("****")));
        assert_eq!(props.get("plan"), Some(&json!("pro")));
    }

    #[test]
    fn test_classify_response() {
        assert!(classify_response("bulker", StatusCode::OK).is_ok());
        assert!(matches!(
            classify_response("bulker", StatusCode::SERVICE_UNAVAILABLE),
            Err(RotorError::Downstream(_))
        ));
        assert!(matches!(
            classify_response("bulker", StatusCode::UNPROCESSABLE_ENTITY),
            Err(RotorError::Config(_))
        ));
    }

    #[test]
    fn test_bulker_step_config_uses_connection_id() {
        let config = bulker_step_config("http://bulker:3042", "secret", &test_connection());
        assert_eq!(config["destinationId"], "c1");
        assert_eq!(config["dataLayout"], "segment");
        assert_eq!(config["bulkerEndpoint"], "http://bulker:3042");
    }

    #[test]
    fn test_standard_registry_lookup() {
        let registry = BuiltinRegistry::standard();
        assert!(registry.transformation("addTimestamp").is_some());
        assert!(registry.transformation("maskFields").is_some());
        assert!(registry.destination("bulker").is_some());
        assert!(registry.destination("webhook").is_some());
        assert!(registry.destination("postgres").is_none());
    }
}
