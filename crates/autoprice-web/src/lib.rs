//! HTTP trigger surface for the summary pipeline.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use autoprice_sync::{SnapshotPipeline, TriggerEvent};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "autoprice-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SnapshotPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SnapshotPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/invoke", post(invoke_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SnapshotPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for invocations");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Body is an optional S3 notification; an empty body is a manual run.
async fn invoke_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let event = TriggerEvent::from_slice(&body);
    match state.pipeline.handle(&event).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!(error = %err, stage = ?err.stage(), "invocation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string(), "stage": err.stage() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use autoprice_adapters::{LocalWarehouse, RecordingChannel};
    use autoprice_core::SourceRecord;
    use autoprice_storage::NotificationChannel;
    use autoprice_sync::{Collaborators, PipelineConfig};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app(register_source: bool) -> Router {
        let warehouse = LocalWarehouse::new();
        if register_source {
            warehouse
                .register_source(
                    "autoprice_db",
                    "autoprice_upload",
                    vec![SourceRecord {
                        make: "A".into(),
                        country: "US".into(),
                        price: 100.0,
                    }],
                )
                .await;
        }
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![RecordingChannel::new()];
        let pipeline = SnapshotPipeline::new(
            PipelineConfig {
                query_output: "s3://results-bucket/".into(),
                summary_location: Some("s3://curated-bucket/summary/".into()),
                query_poll_interval: Duration::from_millis(1),
                table_poll_interval: Duration::from_millis(1),
                source_wait_timeout: Duration::from_millis(10),
                ..PipelineConfig::default()
            },
            Collaborators {
                queries: warehouse.clone(),
                catalog: warehouse.clone(),
                discovery: warehouse.clone(),
                objects: warehouse.clone(),
                channels,
            },
        )
        .unwrap();
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn invoke(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/invoke")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = test_app(false)
            .await
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_invocation_completes() {
        let resp = test_app(true).await.oneshot(invoke("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "completed");
        assert!(body["key"].is_null());
    }

    #[tokio::test]
    async fn non_csv_upload_is_skipped() {
        let event = r#"{"Records":[{"s3":{"bucket":{"name":"uploads"},"object":{"key":"readme.md"}}}]}"#;
        let resp = test_app(false).await.oneshot(invoke(event)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["bucket"], "uploads");
        assert_eq!(body["key"], "readme.md");
    }

    #[tokio::test]
    async fn failed_run_returns_server_error() {
        let resp = test_app(false).await.oneshot(invoke("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["stage"], "catalog_ready");
        assert!(body["error"].as_str().unwrap().contains("Source table not ready"));
    }
}
