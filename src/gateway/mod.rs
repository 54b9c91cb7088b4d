//! # HTTP Gateway
//!
//! axum router exposing the bridge to ordinary HTTP clients.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /health` | [`handlers::health`] |
//! | `GET /info` | [`handlers::info`] |
//! | `GET /nodes` | [`handlers::nodes`] |
//! | `POST /send` | [`handlers::send`] |
//! | `GET /messages` | [`stream::messages`] (Server-Sent Events) |
//!
//! All shared state lives in [`BridgeContext`], injected as router state.

pub mod handlers;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::link::ConnectionSupervisor;
use crate::relay::RelayQueue;
use crate::validation::SendRequestError;

#[derive(Clone)]
pub struct BridgeContext {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub relay: Arc<RelayQueue>,
    /// Device path reported by `/health` and `/info`.
    pub device: Arc<str>,
    /// Stream silence before a heartbeat comment.
    pub heartbeat: Duration,
    /// Flips to true when the process is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl BridgeContext {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        relay: Arc<RelayQueue>,
        heartbeat: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let device: Arc<str> = Arc::from(supervisor.device());
        Self {
            supervisor,
            relay,
            device,
            heartbeat,
            shutdown,
        }
    }
}

/// Error responses. Every variant renders as JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    BadRequest(#[from] SendRequestError),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    SendFailed(String),
}

impl ApiError {
    pub fn not_connected() -> Self {
        ApiError::Unavailable("Not connected to device".to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) | ApiError::SendFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::SendFailed(msg) => json!({ "error": msg, "ok": false }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Run blocking supervisor work off the async workers. A panic in `f` becomes
/// a 500 for this request only.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("blocking device task failed: {}", e);
        ApiError::Internal("Internal error while talking to device".to_string())
    })
}

/// `ensure_connected` on the blocking pool; 503 if no usable session results.
pub(crate) async fn require_connection(ctx: &BridgeContext) -> Result<(), ApiError> {
    let supervisor = Arc::clone(&ctx.supervisor);
    if blocking(move || supervisor.ensure_connected()).await? {
        Ok(())
    } else {
        Err(ApiError::not_connected())
    }
}

pub fn router(ctx: BridgeContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/info", get(handlers::info))
        .route("/nodes", get(handlers::nodes))
        .route("/send", post(handlers::send))
        .route("/messages", get(stream::messages))
        .with_state(ctx)
}

/// Resolves once the flag is true. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Serve until the context's shutdown signal fires.
pub async fn serve(listener: TcpListener, ctx: BridgeContext) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("HTTP gateway listening on http://{}", addr);
    let mut shutdown = ctx.shutdown.clone();
    let app = router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_requested(&mut shutdown).await;
            info!("HTTP gateway shutting down");
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::from(SendRequestError::EmptyBody).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_connected().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::SendFailed("radio busy".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn blocking_task_panic_becomes_internal_error() {
        let result: Result<(), ApiError> = blocking(|| panic!("driver blew up")).await;
        assert!(matches!(result, Err(ApiError::Internal(_))));
    }

    #[tokio::test]
    async fn shutdown_waits_for_true() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown observed")
            .unwrap();
    }
}
