//! HTTP server for health checks, metrics, and UDF debugging
//!
//! Operator endpoints only; event traffic never flows through here.
//!
//! - `GET /health`: liveness probe
//! - `GET /metrics`: Prometheus text exposition
//! - `POST /udfrun`: compile and run a user function against a supplied
//!   event, without touching the bus or the wrapper cache

use crate::model::{
    AnalyticsEvent, ConnectionInfo, DestinationInfo, SourceInfo, UdfContext,
};
use crate::pipeline::executor::{execute_chain, ChainResult};
use crate::pipeline::{ChainStep, StepContext, StepExec, StepKind, StepOutput};
use crate::store::{InMemoryKvStore, KvBinding};
use crate::udf::{UdfCompiler, UdfOutput, UdfWrapper};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state behind the operator endpoints.
#[derive(Clone)]
pub struct HttpServerState {
    pub metrics_handle: PrometheusHandle,
    pub compiler: Arc<dyn UdfCompiler>,
}

/// Build the operator router.
pub fn create_router(state: HttpServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/udfrun", post(udfrun))
        .with_state(state)
}

/// Serve the operator endpoints until the shutdown signal flips.
pub async fn run_server(
    state: HttpServerState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> crate::error::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::RotorError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "operator http server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
        .map_err(|e| crate::error::RotorError::Config(format!("http server failed: {e}")))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<HttpServerState>) -> String {
    state.metrics_handle.render()
}

/// Request body for ad-hoc UDF execution.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UdfRunRequest {
    #[serde(default)]
    function_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    code: String,
    event: AnalyticsEvent,
    #[serde(default)]
    config: Option<Value>,
}

/// Wraps a freshly compiled wrapper as a single chain step. No disposed
/// recovery: the wrapper lives only for this request.
struct AdHocUdfStep {
    wrapper: Arc<dyn UdfWrapper>,
}

#[async_trait::async_trait]
impl StepExec for AdHocUdfStep {
    async fn exec(
        &self,
        event: AnalyticsEvent,
        ctx: &StepContext,
        _config: &Value,
    ) -> crate::error::Result<StepOutput> {
        let udf_ctx = UdfContext::from(&ctx.event_context);
        match self.wrapper.invoke(event, &udf_ctx, &ctx.store).await? {
            UdfOutput::One(out) => Ok(StepOutput::One(out)),
            UdfOutput::Many(out) => Ok(StepOutput::Many(out)),
            UdfOutput::Drop => Ok(StepOutput::Drop),
        }
    }
}

async fn udfrun(
    State(state): State<HttpServerState>,
    Json(request): Json<UdfRunRequest>,
) -> Response {
    let function_id = request
        .function_id
        .unwrap_or_else(|| "udf.adhoc".to_string());
    let name = request.name.unwrap_or_else(|| "adhoc".to_string());

    let wrapper = match state
        .compiler
        .compile(&function_id, &name, &request.code)
        .await
    {
        Ok(wrapper) => wrapper,
        Err(err) => {
            error!(error = %err, "udfrun compile failed");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let step = ChainStep::new(
        function_id.clone(),
        StepKind::Transformation,
        request.config.unwrap_or(Value::Null),
        Arc::new(AdHocUdfStep {
            wrapper: wrapper.clone(),
        }),
    );
    let ctx = debug_context(&function_id);
    let result: ChainResult = execute_chain(&[step], request.event, &ctx).await;
    wrapper.close();

    (StatusCode::OK, Json(result)).into_response()
}

/// Synthetic context for ad-hoc runs: empty connection, throwaway KV.
fn debug_context(function_id: &str) -> StepContext {
    let connection = Arc::new(crate::model::EnrichedConnection {
        id: "udfrun".into(),
        workspace_id: "udfrun".into(),
        stream_id: "udfrun".into(),
        destination_id: "udfrun".into(),
        destination_type: "none".into(),
        updated_at: None,
        credentials_hash: None,
        mode: "debug".into(),
        options: Default::default(),
        uses_bulker: false,
        credentials: Default::default(),
    });
    StepContext {
        event_context: crate::model::EventContext {
            headers: None,
            geo: None,
            retries: 0,
            source: SourceInfo {
                id: "udfrun".into(),
                domain: None,
            },
            destination: DestinationInfo {
                id: function_id.to_string(),
                destination_type: "none".into(),
                updated_at: None,
                credentials_hash: None,
            },
            connection: ConnectionInfo {
                id: "udfrun".into(),
                mode: "debug".into(),
                options: Default::default(),
            },
        },
        connection,
        store: KvBinding::new("udfrun", Arc::new(InMemoryKvStore::new())),
        system: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, RotorError};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct UppercaseCompiler;

    struct UppercaseWrapper;

    #[async_trait::async_trait]
    impl UdfWrapper for UppercaseWrapper {
        async fn invoke(
            &self,
            mut event: AnalyticsEvent,
            _ctx: &UdfContext,
            _store: &KvBinding,
        ) -> Result<UdfOutput> {
            event.event = event.event.map(|e| e.to_uppercase());
            Ok(UdfOutput::One(event))
        }

        fn close(&self) {}
    }

    #[async_trait::async_trait]
    impl UdfCompiler for UppercaseCompiler {
        async fn compile(
            &self,
            _id: &str,
            _name: &str,
            code: &str,
        ) -> Result<Arc<dyn UdfWrapper>> {
            if code.contains("syntax error") {
                return Err(RotorError::UdfRuntime {
                    function_id: "adhoc".into(),
                    message: "syntax error".into(),
                });
            }
            Ok(Arc::new(UppercaseWrapper))
        }
    }

    fn test_router() -> Router {
        create_router(HttpServerState {
            metrics_handle: crate::metrics::init_metrics(),
            compiler: Arc::new(UppercaseCompiler),
        })
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_metrics_renders() {
        let response = test_router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_udfrun_executes_function() {
        let body = json!({
            "code": "event.event = event.event.toUpperCase()",
            "event": {"type": "track", "messageId": "m1", "event": "click"}
        });
        let response = test_router()
            .oneshot(
                Request::post("/udfrun")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let result: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result["events"][0]["event"], "CLICK");
        assert_eq!(result["log"][0]["status"], "ok");
    }

    #[tokio::test]
    async fn test_udfrun_compile_failure_is_422() {
        let body = json!({
            "code": "syntax error here",
            "event": {"type": "track", "messageId": "m1"}
        });
        let response = test_router()
            .oneshot(
                Request::post("/udfrun")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
