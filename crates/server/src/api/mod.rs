use crate::config::AppState;
use adpilot_core::EngineError;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server, returning once `shutdown` resolves
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Workflows
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/triggers/{trigger_id}",
            put(handlers::set_trigger_enabled),
        )
        .route(
            "/api/workflows/{workflow_id}/execute",
            post(handlers::execute_workflow),
        )
        .route(
            "/api/workflows/{workflow_id}/executions",
            get(handlers::list_workflow_executions),
        )
        // Executions
        .route("/api/executions", get(handlers::list_executions))
        .route(
            "/api/executions/{execution_id}",
            get(handlers::get_execution).delete(handlers::evict_execution),
        )
        .route(
            "/api/executions/{execution_id}/status",
            get(handlers::get_execution_status),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::cancel_execution),
        )
        // Events
        .route("/api/events/{name}", post(handlers::emit_event))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "adpilot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

/// HTTP status for an engine error
fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::InvalidWorkflow(_)
        | EngineError::CyclicDependency(_)
        | EngineError::UnknownActionType(_) => StatusCode::BAD_REQUEST,
        EngineError::WorkflowNotFound(_)
        | EngineError::TriggerNotFound { .. }
        | EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::WorkflowBusy(_) | EngineError::ExecutionStillRunning(_) => StatusCode::CONFLICT,
        EngineError::ActionTimeout { .. }
        | EngineError::ActionFailed { .. }
        | EngineError::ExecutionCancelled(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self.error.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = error
            .downcast_ref::<EngineError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self { status, error }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::{EngineConfig, TriggerId, WorkflowEngine, WorkflowId};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        create_router(AppState {
            engine: WorkflowEngine::new(EngineConfig::default()),
        })
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn launch_workflow() -> Value {
        json!({
            "id": "launch",
            "name": "Launch",
            "variables": { "channel": "#marketing" },
            "triggers": [{ "id": "manual", "kind": "manual" }],
            "actions": [
                {
                    "id": "create",
                    "kind": "create_campaign",
                    "parameters": { "name": "Spring", "budget": 100.0 }
                },
                {
                    "id": "announce",
                    "kind": "notify",
                    "depends_on": ["create"],
                    "parameters": {
                        "channel": "${channel}",
                        "message": "Launched ${results.create.campaign_id}"
                    }
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&router(), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let router = router();

        let (status, body) = send(&router, Method::POST, "/api/workflows", Some(launch_workflow())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["workflow_id"], json!("launch"));

        let (status, _) = send(&router, Method::POST, "/api/workflows", Some(launch_workflow())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&router, Method::GET, "/api/workflows/launch", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["actions"].as_array().unwrap().len(), 2);

        let (_, body) = send(&router, Method::GET, "/api/workflows", None).await;
        assert_eq!(body["workflows"].as_array().unwrap().len(), 1);

        let mut updated = launch_workflow();
        updated["description"] = json!("Now with a description");
        let (status, _) = send(&router, Method::PUT, "/api/workflows/launch", Some(updated.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&router, Method::PUT, "/api/workflows/other", Some(updated)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, Method::DELETE, "/api/workflows/launch", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, Method::GET, "/api/workflows/launch", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("launch"));
    }

    #[tokio::test]
    async fn test_cyclic_workflow_is_bad_request() {
        let workflow = json!({
            "id": "loop",
            "name": "Loop",
            "actions": [
                { "id": "a", "kind": "notify", "depends_on": ["b"] },
                { "id": "b", "kind": "notify", "depends_on": ["a"] }
            ]
        });
        let (status, body) = send(&router(), Method::POST, "/api/workflows", Some(workflow)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Cyclic"));
    }

    #[tokio::test]
    async fn test_execute_and_inspect() {
        let router = router();
        send(&router, Method::POST, "/api/workflows", Some(launch_workflow())).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/workflows/launch/execute",
            Some(json!({ "wait": true, "variables": { "channel": "#launches" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["status"], json!("completed"));
        let execution_id = body["execution_id"].as_str().unwrap().to_string();

        let (status, execution) =
            send(&router, Method::GET, &format!("/api/executions/{}", execution_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(execution["results"]["announce"]["channel"], json!("#launches"));

        let (_, summary) = send(
            &router,
            Method::GET,
            &format!("/api/executions/{}/status", execution_id),
            None,
        )
        .await;
        assert_eq!(summary["completed"].as_array().unwrap().len(), 2);

        let (_, listed) = send(&router, Method::GET, "/api/workflows/launch/executions", None).await;
        assert_eq!(listed["executions"].as_array().unwrap().len(), 1);

        let (status, body) = send(
            &router,
            Method::POST,
            &format!("/api/executions/{}/cancel", execution_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], json!(false));

        let (status, _) = send(
            &router,
            Method::DELETE,
            &format!("/api/executions/{}", execution_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            send(&router, Method::GET, &format!("/api/executions/{}", execution_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_execution_id() {
        let (status, _) = send(&router(), Method::GET, "/api/executions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_execute_unknown_workflow() {
        let (status, _) = send(
            &router(),
            Method::POST,
            "/api/workflows/ghost/execute",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_toggle_trigger_and_emit_event() {
        let router = router();
        let workflow = json!({
            "id": "review",
            "name": "Review",
            "triggers": [{ "id": "on_upload", "kind": "event", "event_name": "creative.uploaded" }],
            "actions": [{ "id": "tell", "kind": "notify", "parameters": { "message": "${trigger.payload.asset}" } }]
        });
        send(&router, Method::POST, "/api/workflows", Some(workflow)).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/events/creative.uploaded",
            Some(json!({ "asset": "hero.png" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribers"], json!(1));

        let (status, _) = send(
            &router,
            Method::PUT,
            "/api/workflows/review/triggers/on_upload",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(
            &router,
            Method::POST,
            "/api/events/creative.uploaded",
            Some(json!({})),
        )
        .await;
        assert_eq!(body["subscribers"], json!(0));

        let (status, _) = send(
            &router,
            Method::PUT,
            "/api/workflows/review/triggers/ghost",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_emit_event_without_body() {
        let router = router();
        let workflow = json!({
            "id": "ping",
            "name": "Ping",
            "triggers": [{ "id": "on_ping", "kind": "event", "event_name": "ping" }],
            "actions": [{ "id": "tell", "kind": "notify", "parameters": { "message": "pong" } }]
        });
        send(&router, Method::POST, "/api/workflows", Some(workflow)).await;

        let (status, body) = send(&router, Method::POST, "/api/events/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribers"], json!(1));

        let execution = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let (_, listed) = send(&router, Method::GET, "/api/workflows/ping/executions", None).await;
                if let Some(execution) = listed["executions"].as_array().and_then(|e| e.first()).cloned() {
                    break execution;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(execution["trigger_data"]["name"], json!("ping"));
        assert_eq!(execution["trigger_data"]["payload"], Value::Null);
    }

    #[test]
    fn test_engine_error_status() {
        let busy = ApiError::from(EngineError::WorkflowBusy(WorkflowId::new("wf")));
        assert_eq!(busy.status, StatusCode::CONFLICT);

        let missing = ApiError::from(EngineError::TriggerNotFound {
            workflow_id: WorkflowId::new("wf"),
            trigger_id: TriggerId::new("t"),
        });
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let other = ApiError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
