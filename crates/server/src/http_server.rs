use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, REFERER, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::{Broker, BrokerError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::{AuthGate, RequestMeta, TOKEN_HEADER},
    config::{CorsConfig, HttpConfig},
    wire::{self, RawRequest, Request, ValidationError},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    broker: Broker,
    gate: Box<dyn AuthGate>,
}

impl AppState {
    pub fn new(broker: Broker, gate: Box<dyn AuthGate>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { broker, gate }),
        }
    }

    fn ensure_trusted(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.inner.gate.is_trusted_caller(&RequestMeta::new(headers)) {
            return Ok(());
        }
        Err(ApiError::Forbidden)
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }
}

#[derive(Debug)]
enum ApiError {
    Validation(ValidationError),
    Forbidden,
    Internal(anyhow::Error),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(err) => {
                tracing::debug!("Rejected request: {}", err);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "success": false, "error": err.to_string() })),
                )
                    .into_response()
            }
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "success": false, "error": "Access is restricted." })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!("Broker request failed: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

pub fn build_router(state: AppState, endpoint: &str, cors: &CorsConfig) -> Router {
    Router::new()
        .route(endpoint, post(handle_action))
        .route("/health", get(health))
        .layer(Extension(state))
        .layer(build_cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

/// Serves until `shutdown` resolves.
pub async fn run_http<F>(
    state: AppState,
    http: &HttpConfig,
    cors: &CorsConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let HttpConfig {
        host,
        port,
        endpoint,
    } = http;

    let router = build_router(state, endpoint, cors);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind courier HTTP server to {addr}"))?;

    tracing::info!("Courier listening on http://{addr}{endpoint}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

/// Agents send JSON as `text/plain`, so the body is parsed whatever the
/// declared content type.
async fn handle_action(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.ensure_trusted(&headers)?;

    let request = Request::try_from(RawRequest::from_slice(&body)?)?;
    let response = wire::dispatch(state.broker(), request)?;

    Ok(Json(response))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "build": courier_build_info::build_id(),
    }))
}

fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            USER_AGENT,
            REFERER,
            AUTHORIZATION,
            HeaderName::from_static(TOKEN_HEADER),
        ]);

    if !config.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        if !origins.is_empty() {
            return layer.allow_origin(AllowOrigin::list(origins));
        }
    }

    layer.allow_origin(Any)
}
