//! Function chain builder
//!
//! Turns a resolved connection into the ordered, executable step list. The
//! declared function list is partitioned in one pass into builtin
//! transformations, user functions, and destinations; the final order is
//! always transformations, then a single synthetic `udf.PIPELINE` step,
//! then destinations, regardless of declared interleaving.

use super::builtins::{bulker_step_config, BuiltinRegistry};
use super::executor::execute_chain;
use super::{ChainStep, StepContext, StepExec, StepKind, StepOutput};
use crate::error::{Result, RotorError};
use crate::model::{
    AnalyticsEvent, EnrichedConnection, FunctionDefinition, FunctionKind, FunctionReference,
    UdfContext,
};
use crate::store::ConfigStore;
use crate::udf::{CompiledUdf, UdfOutput, UdfRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Synthetic id of the step wrapping all user functions.
pub const UDF_PIPELINE_STEP_ID: &str = "udf.PIPELINE";

/// Invocation attempts per UDF call: the original plus one transparent
/// rebuild after a disposed sandbox.
const MAX_UDF_ATTEMPTS: u32 = 2;

/// Predicate over function ids, applied before UDF resolution (a skipped
/// UDF is never fetched) and again inside the pipeline step. Supports
/// dry-run and single-function debugging.
pub type FunctionFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Builds executable chains from connection configuration.
pub struct ChainBuilder {
    config_store: Arc<ConfigStore>,
    udf_registry: Arc<UdfRegistry>,
    builtins: Arc<BuiltinRegistry>,
    bulker_endpoint: String,
    bulker_auth_key: String,
}

impl ChainBuilder {
    pub fn new(
        config_store: Arc<ConfigStore>,
        udf_registry: Arc<UdfRegistry>,
        builtins: Arc<BuiltinRegistry>,
        bulker_endpoint: impl Into<String>,
        bulker_auth_key: impl Into<String>,
    ) -> Self {
        Self {
            config_store,
            udf_registry,
            builtins,
            bulker_endpoint: bulker_endpoint.into(),
            bulker_auth_key: bulker_auth_key.into(),
        }
    }

    /// Produce the ordered step list for `connection`.
    pub async fn build(
        &self,
        connection: &Arc<EnrichedConnection>,
        filter: Option<FunctionFilter>,
    ) -> Result<Vec<ChainStep>> {
        let terminal = self.terminal_destination(connection)?;

        let mut transformations: Vec<ChainStep> = Vec::new();
        let mut udf_chain: Vec<ChainStep> = Vec::new();
        let mut destinations: Vec<ChainStep> = Vec::new();

        let declared = connection.options.functions.iter();
        let raw: Vec<&FunctionReference> =
            declared.chain(std::iter::once(&terminal.reference)).collect();
        let terminal_index = raw.len() - 1;

        for (index, reference) in raw.into_iter().enumerate() {
            if let Some(filter) = &filter {
                if !filter(&reference.function_id) {
                    continue;
                }
            }
            let config = if index == terminal_index {
                terminal.config.clone().unwrap_or(Value::Null)
            } else {
                reference.function_options.clone().unwrap_or(Value::Null)
            };
            match FunctionKind::parse(&reference.function_id)? {
                FunctionKind::BuiltinTransformation(name) => {
                    let exec = self.builtins.transformation(&name).ok_or_else(|| {
                        RotorError::Config(format!(
                            "builtin transformation '{name}' is not registered"
                        ))
                    })?;
                    transformations.push(ChainStep::new(
                        reference.function_id.clone(),
                        StepKind::Transformation,
                        config,
                        exec,
                    ));
                }
                FunctionKind::Udf(key) => {
                    let definition = self.config_store.get_function(&key).await?;
                    if definition.workspace_id != connection.workspace_id {
                        return Err(RotorError::WorkspaceMismatch {
                            function_id: reference.function_id.clone(),
                            function_workspace: definition.workspace_id.clone(),
                            connection_workspace: connection.workspace_id.clone(),
                        });
                    }
                    let compiled = self
                        .udf_registry
                        .acquire(&key, &definition.name, &definition.code)
                        .await?;
                    udf_chain.push(ChainStep::new(
                        reference.function_id.clone(),
                        StepKind::Transformation,
                        config,
                        Arc::new(UdfStepExec {
                            key,
                            definition,
                            registry: self.udf_registry.clone(),
                            compiled: Mutex::new(compiled),
                        }),
                    ));
                }
                FunctionKind::BuiltinDestination(name) => {
                    let exec = self.builtins.destination(&name).ok_or_else(|| {
                        RotorError::Config(format!(
                            "builtin destination '{name}' is not registered"
                        ))
                    })?;
                    destinations.push(ChainStep::new(
                        reference.function_id.clone(),
                        StepKind::Destination,
                        config,
                        exec,
                    ));
                }
            }
        }

        let mut chain = transformations;
        if !udf_chain.is_empty() {
            chain.push(ChainStep::new(
                UDF_PIPELINE_STEP_ID,
                StepKind::UdfPipeline,
                Value::Null,
                Arc::new(UdfPipelineExec {
                    inner: udf_chain,
                    filter,
                }),
            ));
        }
        chain.extend(destinations);
        Ok(chain)
    }

    /// Resolve the terminal destination for the connection.
    fn terminal_destination(&self, connection: &EnrichedConnection) -> Result<TerminalStep> {
        if connection.uses_bulker {
            return Ok(TerminalStep {
                reference: FunctionReference {
                    function_id: "builtin.destination.bulker".to_string(),
                    function_options: None,
                },
                config: Some(bulker_step_config(
                    &self.bulker_endpoint,
                    &self.bulker_auth_key,
                    connection,
                )),
            });
        }
        let name = connection.destination_type.clone();
        if self.builtins.destination(&name).is_none() {
            return Err(RotorError::Config(format!(
                "no builtin destination for connection type '{name}'"
            )));
        }
        Ok(TerminalStep {
            reference: FunctionReference {
                function_id: format!("builtin.destination.{name}"),
                function_options: None,
            },
            config: None,
        })
    }
}

/// The appended terminal destination, with its pre-assembled config.
struct TerminalStep {
    reference: FunctionReference,
    config: Option<Value>,
}

// ---------------------------------------------------------------------------
// UDF steps
// ---------------------------------------------------------------------------

/// One user function inside the pipeline step. Holds the compiled wrapper
/// and rebuilds it once when the sandbox turns out to be disposed.
struct UdfStepExec {
    key: String,
    definition: Arc<FunctionDefinition>,
    registry: Arc<UdfRegistry>,
    compiled: Mutex<CompiledUdf>,
}

#[async_trait]
impl StepExec for UdfStepExec {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        _config: &Value,
    ) -> Result<StepOutput> {
        let udf_ctx = UdfContext::from(&ctx.event_context);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let compiled = self.compiled.lock().clone();
            match compiled
                .wrapper
                .invoke(event.clone(), &udf_ctx, &ctx.store)
                .await
            {
                Ok(UdfOutput::One(out)) => return Ok(StepOutput::One(out)),
                Ok(UdfOutput::Many(out)) => return Ok(StepOutput::Many(out)),
                Ok(UdfOutput::Drop) => return Ok(StepOutput::Drop),
                Err(RotorError::SandboxDisposed(_)) if attempt < MAX_UDF_ATTEMPTS => {
                    warn!(function = %self.key, "sandbox disposed, rebuilding wrapper");
                    let rebuilt = self
                        .registry
                        .recompile(&self.key, &self.definition.name, &self.definition.code)
                        .await?;
                    *self.compiled.lock() = rebuilt;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The synthetic `udf.PIPELINE` step: runs the user-function chain through
/// the executor recursively. Any inner failure fails this step; a
/// retryable inner failure keeps its retryability.
struct UdfPipelineExec {
    inner: Vec<ChainStep>,
    filter: Option<FunctionFilter>,
}

#[async_trait]
impl StepExec for UdfPipelineExec {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        _config: &Value,
    ) -> Result<StepOutput> {
        let result = match &self.filter {
            Some(filter) => {
                let active: Vec<ChainStep> = self
                    .inner
                    .iter()
                    .filter(|step| filter(&step.id))
                    .cloned()
                    .collect();
                execute_chain(&active, event, ctx).await
            }
            None => execute_chain(&self.inner, event, ctx).await,
        };

        let mut fatal: Option<(String, String)> = None;
        for entry in &result.log {
            if let Some(error) = &entry.error {
                if error.retryable {
                    return Err(RotorError::Downstream(format!(
                        "{}: {}",
                        entry.step_id, error.message
                    )));
                }
                fatal.get_or_insert((entry.step_id.clone(), error.message.clone()));
            }
        }
        if let Some((step_id, message)) = fatal {
            return Err(RotorError::UdfRuntime {
                function_id: step_id,
                message,
            });
        }

        Ok(match result.events.len() {
            0 => StepOutput::Drop,
            1 => {
                let mut events = result.events;
                StepOutput::One(events.remove(0))
            }
            _ => StepOutput::Many(result.events),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfigLoader, KvBinding};
    use crate::udf::{UdfCompiler, UdfWrapper};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MapLoader {
        functions: HashMap<String, Value>,
        function_loads: AtomicUsize,
    }

    #[async_trait]
    impl ConfigLoader for MapLoader {
        async fn load(&self, kind: &str, key: &str) -> Result<Option<Value>> {
            match kind {
                "function" => {
                    self.function_loads.fetch_add(1, Ordering::SeqCst);
                    Ok(self.functions.get(key).cloned())
                }
                _ => Ok(None),
            }
        }
    }

    struct EchoWrapper;

    #[async_trait]
    impl UdfWrapper for EchoWrapper {
        async fn invoke(
            &self,
            event: AnalyticsEvent,
            _ctx: &UdfContext,
            _store: &KvBinding,
        ) -> Result<UdfOutput> {
            Ok(UdfOutput::One(event))
        }

        fn close(&self) {}
    }

    struct EchoCompiler;

    #[async_trait]
    impl UdfCompiler for EchoCompiler {
        async fn compile(
            &self,
            _id: &str,
            _name: &str,
            _code: &str,
        ) -> Result<Arc<dyn UdfWrapper>> {
            Ok(Arc::new(EchoWrapper))
        }
    }

    struct Identity;

    #[async_trait]
    impl StepExec for Identity {
        async fn exec(
            &self,
            event: AnalyticsEvent,
            _ctx: &StepContext,
            _config: &Value,
        ) -> Result<StepOutput> {
            Ok(StepOutput::One(event))
        }
    }

    fn registry_with_identities() -> BuiltinRegistry {
        let mut registry = BuiltinRegistry::new();
        registry.register_transformation("addTimestamp", Arc::new(Identity));
        registry.register_destination("bulker", Arc::new(Identity));
        registry.register_destination("webhook", Arc::new(Identity));
        registry
    }

    fn builder_with(
        functions: HashMap<String, Value>,
        builtins: BuiltinRegistry,
    ) -> (ChainBuilder, Arc<MapLoader>) {
        let loader = Arc::new(MapLoader {
            functions,
            function_loads: AtomicUsize::new(0),
        });
        let config_store = Arc::new(ConfigStore::new(
            loader.clone(),
            Duration::from_secs(20),
            Duration::from_secs(20),
        ));
        let udf_registry = Arc::new(UdfRegistry::new(
            Arc::new(EchoCompiler),
            Duration::from_secs(600),
        ));
        (
            ChainBuilder::new(
                config_store,
                udf_registry,
                Arc::new(builtins),
                "http://bulker:3042",
                "token",
            ),
            loader,
        )
    }

    fn connection(options: Value) -> Arc<EnrichedConnection> {
        Arc::new(
            serde_json::from_value(json!({
                "id": "c1",
                "workspaceId": "w1",
                "streamId": "s1",
                "destinationId": "d1",
                "type": "webhook",
                "mode": "stream",
                "usesBulker": true,
                "options": options
            }))
            .unwrap(),
        )
    }

    fn function_def(id: &str, workspace: &str) -> Value {
        json!({
            "id": id,
            "workspaceId": workspace,
            "name": format!("Function {id}"),
            "code": format!("export default (e) => e // {id}")
        })
    }

    #[tokio::test]
    async fn test_reorders_into_transform_udf_destination() {
        let (builder, _) = builder_with(
            HashMap::from([("f1".to_string(), function_def("f1", "w1"))]),
            registry_with_identities(),
        );
        // Declared order deliberately interleaved.
        let conn = connection(json!({
            "functions": [
                {"functionId": "udf.f1"},
                {"functionId": "builtin.transformation.addTimestamp"}
            ]
        }));
        let chain = builder.build(&conn, None).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "builtin.transformation.addTimestamp",
                UDF_PIPELINE_STEP_ID,
                "builtin.destination.bulker"
            ]
        );
        assert_eq!(chain[1].kind, StepKind::UdfPipeline);
        assert_eq!(chain[2].kind, StepKind::Destination);
    }

    #[tokio::test]
    async fn test_no_udfs_means_no_pipeline_step() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn = connection(json!({}));
        let chain = builder.build(&conn, None).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["builtin.destination.bulker"]);
    }

    #[tokio::test]
    async fn test_bulker_terminal_config() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn = connection(json!({"dataLayout": "segment"}));
        let chain = builder.build(&conn, None).await.unwrap();
        let terminal = chain.last().unwrap();
        assert_eq!(terminal.config["destinationId"], "c1");
        assert_eq!(terminal.config["dataLayout"], "segment");
        assert_eq!(terminal.config["authToken"], "token");
    }

    #[tokio::test]
    async fn test_non_bulker_uses_type_builtin() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn: Arc<EnrichedConnection> = Arc::new(
            serde_json::from_value(json!({
                "id": "c1",
                "workspaceId": "w1",
                "streamId": "s1",
                "destinationId": "d1",
                "type": "webhook",
                "usesBulker": false
            }))
            .unwrap(),
        );
        let chain = builder.build(&conn, None).await.unwrap();
        assert_eq!(chain.last().unwrap().id, "builtin.destination.webhook");
    }

    #[tokio::test]
    async fn test_missing_destination_builtin_is_config_error() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn: Arc<EnrichedConnection> = Arc::new(
            serde_json::from_value(json!({
                "id": "c1",
                "workspaceId": "w1",
                "streamId": "s1",
                "destinationId": "d1",
                "type": "postgres",
                "usesBulker": false
            }))
            .unwrap(),
        );
        let err = builder.build(&conn, None).await.unwrap_err();
        assert!(matches!(err, RotorError::Config(_)));
    }

    #[tokio::test]
    async fn test_workspace_mismatch_is_fatal() {
        let (builder, _) = builder_with(
            HashMap::from([("f9".to_string(), function_def("f9", "w2"))]),
            registry_with_identities(),
        );
        let conn = connection(json!({"functions": [{"functionId": "udf.f9"}]}));
        let err = builder.build(&conn, None).await.unwrap_err();
        assert!(matches!(err, RotorError::WorkspaceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unknown_function_reference() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn = connection(json!({"functions": [{"functionId": "udf.ghost"}]}));
        let err = builder.build(&conn, None).await.unwrap_err();
        assert!(matches!(err, RotorError::UnknownFunction(_)));
    }

    #[tokio::test]
    async fn test_unknown_function_type() {
        let (builder, _) = builder_with(HashMap::new(), registry_with_identities());
        let conn = connection(json!({"functions": [{"functionId": "plugin.weird"}]}));
        let err = builder.build(&conn, None).await.unwrap_err();
        assert!(matches!(err, RotorError::UnknownFunctionType(_)));
    }

    #[tokio::test]
    async fn test_filter_skips_udf_fetch() {
        let (builder, loader) = builder_with(
            HashMap::from([("f1".to_string(), function_def("f1", "w1"))]),
            registry_with_identities(),
        );
        let conn = connection(json!({"functions": [{"functionId": "udf.f1"}]}));
        let filter: FunctionFilter = Arc::new(|id| !id.starts_with("udf."));
        let chain = builder.build(&conn, Some(filter)).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["builtin.destination.bulker"]);
        assert_eq!(loader.function_loads.load(Ordering::SeqCst), 0);
    }
}
