//! HTTP admin surface plus the `/ws` upgrade route. The static web UI file server and the
//! metrics exposition endpoint live outside this crate's scope — this module carries only the
//! four asset-admin endpoints and the WebSocket upgrade, wired up as one small `axum::Router`.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::StreamingConfig;
use crate::hub::Hub;
use crate::protocol::ServerMessage;
use crate::session;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub streaming: StreamingConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/assets/upload", post(upload_asset))
        .route("/api/assets", get(list_assets))
        .route("/api/assets/:asset_id", get(get_asset).delete(remove_asset))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.hub.has_capacity() {
        tracing::warn!("refusing connection: session cap reached ({} sessions)", state.hub.session_count());
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| session::handle_connection(socket, state.hub, state.streaming))
}

#[derive(Deserialize)]
struct UploadQuery {
    #[serde(rename = "assetId")]
    asset_id: String,
}

async fn upload_asset(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Response {
    let hub = state.hub.clone();
    let asset_id = query.asset_id.clone();
    let bytes = body.to_vec();
    let size = bytes.len();

    // Generation shells out / runs the in-process simplifier; runs on the blocking pool so the
    // request task never stalls the async runtime. The HTTP response blocks on generation
    // completing, but nothing else on this process does.
    let result = tokio::task::spawn_blocking(move || hub.assets.upload(&asset_id, &bytes)).await;

    match result {
        Ok(Ok(lods)) => {
            state.hub.broadcast_all(ServerMessage::AssetUploaded {
                asset_id: query.asset_id.clone(),
                lod_levels: lods.clone(),
            });
            Json(serde_json::json!({
                "success": true,
                "assetId": query.asset_id,
                "lodLevels": lods,
                "sizes": { "high": size },
            }))
            .into_response()
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": "upload failed" })),
        )
            .into_response(),
    }
}

async fn list_assets(State(state): State<AppState>) -> Response {
    let assets: Vec<_> = state
        .hub
        .assets
        .list()
        .into_iter()
        .map(|(id, lods, has_nerf)| serde_json::json!({ "id": id, "lods": lods, "hasNerf": has_nerf }))
        .collect();
    Json(serde_json::json!({ "assets": assets })).into_response()
}

async fn get_asset(State(state): State<AppState>, Path(asset_id): Path<String>) -> Response {
    if !state.hub.assets.exists(&asset_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let entry = state
        .hub
        .assets
        .list()
        .into_iter()
        .find(|(id, _, _)| id == &asset_id);
    match entry {
        Some((id, lods, has_nerf)) => {
            Json(serde_json::json!({ "id": id, "lods": lods, "hasNerf": has_nerf })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn remove_asset(State(state): State<AppState>, Path(asset_id): Path<String>) -> Response {
    let removed = state.hub.assets.remove(&asset_id);
    if removed {
        state
            .hub
            .broadcast_all(ServerMessage::AssetRemoved { asset_id: asset_id.clone() });
    }
    Json(serde_json::json!({ "success": removed })).into_response()
}
