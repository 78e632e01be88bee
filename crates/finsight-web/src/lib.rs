//! HTTP trigger for the insight run.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use finsight_job::{authorize_service_request, JobError, JobRunner, RunSummary};
use secrecy::SecretString;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "finsight-web";
pub const DEFAULT_PORT: u16 = 8000;

const ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

pub struct AppState {
    pub runner: Arc<JobRunner>,
    pub service_key: SecretString,
}

impl AppState {
    pub fn new(runner: Arc<JobRunner>, service_key: SecretString) -> Self {
        Self {
            runner,
            service_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    success: bool,
    users_processed: usize,
    successful: usize,
    errors: usize,
    total_insights: usize,
    duration_ms: u64,
}

impl From<&RunSummary> for TriggerResponse {
    fn from(summary: &RunSummary) -> Self {
        Self {
            success: true,
            users_processed: summary.users_processed,
            successful: summary.successful,
            errors: summary.errors,
            total_insights: summary.total_insights,
            duration_ms: summary.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    duration_ms: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/observer-cron", any(trigger_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(runner: Arc<JobRunner>, service_key: SecretString, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "insight trigger listening");
    axum::serve(listener, app(AppState::new(runner, service_key))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if method == Method::OPTIONS {
        return with_cors("ok".into_response());
    }

    let started = Instant::now();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let result = match authorize_service_request(authorization, &state.service_key) {
        Ok(()) => state.runner.run_once().await,
        Err(err) => Err(err),
    };

    let response = match result {
        Ok(summary) => Json(TriggerResponse::from(&summary)).into_response(),
        Err(err) => job_error(err, started),
    };
    with_cors(response)
}

fn job_error(err: JobError, started: Instant) -> Response {
    error!(error = %err, "insight run failed");
    let body = ErrorResponse {
        error: err.to_string(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use finsight_core::Subscription;
    use finsight_detect::Analyzer;
    use finsight_job::RunOptions;
    use finsight_storage::MemoryFinanceStore;
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;
    use uuid::Uuid;

    const KEY: &str = "service-role-secret";

    async fn seeded_app() -> (Router, Arc<MemoryFinanceStore>) {
        let store = Arc::new(MemoryFinanceStore::new());
        let user = Uuid::new_v4();
        store.add_user(user).await;
        store
            .add_subscription(
                user,
                Subscription {
                    id: Uuid::new_v4(),
                    merchant_name: "Streamly".into(),
                    amount: dec!(10.00),
                    last_charge_amount: Some(dec!(11.50)),
                    confirmed: true,
                },
            )
            .await;
        let runner = JobRunner::new(store.clone(), Analyzer::default(), RunOptions::default());
        let state = AppState::new(Arc::new(runner), SecretString::from(KEY.to_string()));
        (app(state), store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn trigger(auth: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/observer-cron");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn preflight_returns_ok_with_cors() {
        let (app, store) = seeded_app().await;
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("OPTIONS")
                    .uri("/observer-cron")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
        assert!(store.insights().await.is_empty());
    }

    #[tokio::test]
    async fn wrong_credential_is_a_fatal_error_and_writes_nothing() {
        let (app, store) = seeded_app().await;
        for auth in [None, Some("Bearer nope"), Some(KEY)] {
            let resp = app.clone().oneshot(trigger(auth)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            let json = body_json(resp).await;
            assert_eq!(json["error"], "Unauthorized");
            assert!(json["duration_ms"].is_u64());
        }
        assert!(store.insights().await.is_empty());
    }

    #[tokio::test]
    async fn authorized_trigger_reports_counts() {
        let (app, store) = seeded_app().await;
        let resp = app
            .oneshot(trigger(Some(&format!("Bearer {KEY}"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["users_processed"], 1);
        assert_eq!(json["successful"], 1);
        assert_eq!(json["errors"], 0);
        assert_eq!(json["total_insights"], 1);
        assert!(json["duration_ms"].is_u64());
        assert_eq!(store.insights().await.len(), 1);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _) = seeded_app().await;
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
