//! Data model for messages, connections, and function references
//!
//! Wire shapes follow the ingest contract: camelCase field names, free-form
//! property bags, and unknown fields carried through rather than dropped.
//! An event that enters the pipeline leaves it byte-equivalent unless a
//! step explicitly rewrote it.

use crate::error::{Result, RotorError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Analytics event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Track,
    Page,
    Identify,
    Group,
    Alias,
    Screen,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Track => write!(f, "track"),
            EventType::Page => write!(f, "page"),
            EventType::Identify => write!(f, "identify"),
            EventType::Group => write!(f, "group"),
            EventType::Alias => write!(f, "alias"),
            EventType::Screen => write!(f, "screen"),
        }
    }
}

/// A single analytics event flowing through the chain.
///
/// Known fields are typed; everything else rides in `extra` so user code
/// and destinations see exactly what was ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Event name; present for `track` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Origin-domain hint captured at ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Origin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Decoded bus payload. The connection id is the sole routing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    pub connection_id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub http_payload: AnalyticsEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl IngestMessage {
    /// Decode a raw bus payload. Any decode failure is a poison message.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| RotorError::MalformedMessage(e.to_string()))
    }
}

/// Table layout requested from the bulker destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLayout {
    #[serde(rename = "segment")]
    Segment,
    #[serde(rename = "jitsu-legacy")]
    JitsuLegacy,
    #[serde(rename = "segment-single-table")]
    SegmentSingleTable,
    #[serde(rename = "passthrough")]
    Passthrough,
}

impl DataLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataLayout::Segment => "segment",
            DataLayout::JitsuLegacy => "jitsu-legacy",
            DataLayout::SegmentSingleTable => "segment-single-table",
            DataLayout::Passthrough => "passthrough",
        }
    }
}

/// Ordered-list element of a connection's configured function chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionReference {
    pub function_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_options: Option<Value>,
}

/// Connection options: the declared function list plus opaque settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default)]
    pub functions: Vec<FunctionReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_layout: Option<DataLayout>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Enriched connection record resolved from the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedConnection {
    pub id: String,
    pub workspace_id: String,
    pub stream_id: String,
    pub destination_id: String,
    #[serde(rename = "type")]
    pub destination_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_hash: Option<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub options: ConnectionOptions,
    #[serde(default)]
    pub uses_bulker: bool,
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

/// Function definition fetched by function id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub code: String,
}

/// Function id class, parsed once at the chain-build boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// `builtin.transformation.<name>`: pure event mapper.
    BuiltinTransformation(String),
    /// `builtin.destination.<name>`: terminal delivery.
    BuiltinDestination(String),
    /// `udf.<id>`: user-defined, sandboxed.
    Udf(String),
}

impl FunctionKind {
    /// Parse a function id. Anything outside the three known namespaces is
    /// an unknown function type.
    pub fn parse(function_id: &str) -> Result<Self> {
        if let Some(name) = function_id.strip_prefix("builtin.transformation.") {
            if !name.is_empty() {
                return Ok(FunctionKind::BuiltinTransformation(name.to_string()));
            }
        }
        if let Some(name) = function_id.strip_prefix("builtin.destination.") {
            if !name.is_empty() {
                return Ok(FunctionKind::BuiltinDestination(name.to_string()));
            }
        }
        if let Some(id) = function_id.strip_prefix("udf.") {
            if !id.is_empty() {
                return Ok(FunctionKind::Udf(id.to_string()));
            }
        }
        Err(RotorError::UnknownFunctionType(function_id.to_string()))
    }
}

/// Source half of the event context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Destination half of the event context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub destination_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_hash: Option<String>,
}

/// Connection summary exposed to steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub mode: String,
    pub options: ConnectionOptions,
}

/// Per-message context assembled by the handler from the ingest fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Value>,
    pub retries: u32,
    pub source: SourceInfo,
    pub destination: DestinationInfo,
    pub connection: ConnectionInfo,
}

impl EventContext {
    /// Build the context from a decoded message and its resolved connection.
    pub fn assemble(message: &IngestMessage, connection: &EnrichedConnection, retries: u32) -> Self {
        Self {
            headers: message.http_headers.clone(),
            geo: message.geo.clone(),
            retries,
            source: SourceInfo {
                id: connection.stream_id.clone(),
                domain: message.origin.as_ref().and_then(|o| o.domain.clone()),
            },
            destination: DestinationInfo {
                id: connection.destination_id.clone(),
                destination_type: connection.destination_type.clone(),
                updated_at: connection.updated_at.clone(),
                credentials_hash: connection.credentials_hash.clone(),
            },
            connection: ConnectionInfo {
                id: connection.id.clone(),
                mode: connection.mode.clone(),
                options: connection.options.clone(),
            },
        }
    }
}

/// Reduced context handed to user code. System context is withheld by
/// construction: this type simply has no field for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub source: SourceInfo,
    pub destination: DestinationInfo,
    pub connection: ConnectionInfo,
    pub retries: u32,
}

impl From<&EventContext> for UdfContext {
    fn from(ctx: &EventContext) -> Self {
        Self {
            geo: ctx.geo.clone(),
            headers: ctx.headers.clone(),
            source: ctx.source.clone(),
            destination: ctx.destination.clone(),
            connection: ctx.connection.clone(),
            retries: ctx.retries,
        }
    }
}
