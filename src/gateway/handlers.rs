//! JSON endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use log::{error, info};
use serde::Serialize;
use serde_json::json;

use super::{blocking, require_connection, ApiError, BridgeContext};
use crate::link::{LinkError, SendError};
use crate::logutil::preview;
use crate::meshtastic::NodeRecord;
use crate::validation::parse_send_request;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub device: String,
    pub error: Option<String>,
    pub timestamp: i64,
    #[serde(rename = "nodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub my_node_id: u32,
    pub firmware: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeRecord>,
}

fn query_error(what: &str, e: LinkError) -> ApiError {
    match e {
        LinkError::NotConnected => ApiError::not_connected(),
        LinkError::Driver(e) => {
            error!("Error getting {}: {}", what, e);
            ApiError::Internal(e.to_string())
        }
    }
}

/// Reports the current link state without trying to connect.
pub async fn health(State(ctx): State<BridgeContext>) -> Result<Response, ApiError> {
    let supervisor = Arc::clone(&ctx.supervisor);
    let status = blocking(move || supervisor.status()).await?;
    let code = if status.connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if status.connected {
            "connected"
        } else {
            "disconnected"
        },
        device: ctx.device.to_string(),
        error: status.last_error,
        timestamp: Utc::now().timestamp(),
        node_id: status.node_num.filter(|_| status.connected),
    };
    Ok((code, Json(body)).into_response())
}

pub async fn info(State(ctx): State<BridgeContext>) -> Result<Json<InfoResponse>, ApiError> {
    require_connection(&ctx).await?;
    let supervisor = Arc::clone(&ctx.supervisor);
    let info = blocking(move || supervisor.query_info())
        .await?
        .map_err(|e| query_error("device info", e))?;
    Ok(Json(InfoResponse {
        my_node_id: info.my_node_num,
        firmware: info.firmware,
        device: ctx.device.to_string(),
        long_name: info.long_name,
        short_name: info.short_name,
    }))
}

pub async fn nodes(State(ctx): State<BridgeContext>) -> Result<Json<NodesResponse>, ApiError> {
    require_connection(&ctx).await?;
    let supervisor = Arc::clone(&ctx.supervisor);
    let nodes = blocking(move || supervisor.query_nodes())
        .await?
        .map_err(|e| query_error("node list", e))?;
    Ok(Json(NodesResponse { nodes }))
}

/// Validates first; a rejected body never reaches the device.
pub async fn send(
    State(ctx): State<BridgeContext>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = parse_send_request(&body)?;
    require_connection(&ctx).await?;

    info!(
        "Sending message to {} ch{}: {}",
        req.destination.as_deref().unwrap_or("broadcast"),
        req.channel_index,
        preview(&req.text, 50)
    );
    let supervisor = Arc::clone(&ctx.supervisor);
    let result = blocking(move || {
        supervisor.send(&req.text, req.destination.as_deref(), req.channel_index)
    })
    .await?;
    match result {
        Ok(()) => Ok(Json(json!({ "ok": true, "sent": true }))),
        Err(SendError::NotConnected) => Err(ApiError::not_connected()),
        Err(e) => {
            error!("Error sending message: {}", e);
            Err(ApiError::SendFailed(e.to_string()))
        }
    }
}
