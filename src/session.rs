//! Session Broker (C7) — the hard part.
//!
//! One task pair per accepted connection: an inbound reader that parses and dispatches frames,
//! and a dedicated outbound writer draining a bounded queue. The socket is split into
//! `SplitSink`/`SplitStream` halves and each half runs as its own task rather than sharing one
//! socket handle.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bandwidth::BandwidthEstimator;
use crate::config::StreamingConfig;
use crate::foveation::{self, Selection};
use crate::hub::{Hub, OutboundFrame};
use crate::objects::GrabOutcome;
use crate::protocol::{ClientMessage, Lod, ServerMessage, Vec3};
use crate::rooms;

const RENDER_MODES: &[&str] = &["splat", "point", "mesh", "hybrid", "wireframe"];

/// Entry point wired up by the HTTP layer's `/ws` route.
#[tracing::instrument(skip(socket, hub, streaming))]
pub async fn handle_connection(socket: WebSocket, hub: Arc<Hub>, streaming: StreamingConfig) {
    let client_id = Uuid::new_v4().to_string();
    tracing::info!(%client_id, "session connected");
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let (ws_sender, ws_receiver) = socket.split();
    let writer = tokio::spawn(run_writer(ws_sender, outbound_rx));

    let (room_id, peers, color, user_positions) = hub.join(&client_id, outbound_tx.clone());
    let welcome = ServerMessage::Welcome {
        id: client_id.clone(),
        peers,
        color: color.to_string(),
        user_positions: serde_json::to_value(&user_positions).unwrap_or(serde_json::Value::Null),
    };
    if outbound_tx.send(OutboundFrame::Text(welcome)).await.is_err() {
        hub.leave(&client_id);
        return;
    }

    run_reader(&client_id, &room_id, &hub, ws_receiver, &outbound_tx, streaming).await;

    hub.leave(&client_id);
    drop(outbound_tx);
    writer.abort();
    tracing::info!(%client_id, "session disconnected");
}

async fn run_writer(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let result = match frame {
            OutboundFrame::Text(message) => send_text(&mut ws_sender, &message).await,
            OutboundFrame::Binary(bytes) => ws_sender.send(Message::Binary(bytes)).await,
            OutboundFrame::Pair(message, bytes) => {
                match send_text(&mut ws_sender, &message).await {
                    Ok(()) => ws_sender.send(Message::Binary(bytes)).await,
                    Err(e) => Err(e),
                }
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn send_text(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).expect("ServerMessage always serializes");
    sender.send(Message::Text(text)).await
}

struct SessionState {
    pose: Option<foveation::Pose>,
    estimator: BandwidthEstimator,
    render_mode: String,
}

async fn run_reader(
    client_id: &str,
    room_id: &str,
    hub: &Arc<Hub>,
    mut ws_receiver: futures::stream::SplitStream<WebSocket>,
    outbound: &mpsc::Sender<OutboundFrame>,
    streaming: StreamingConfig,
) {
    let mut state = SessionState {
        pose: None,
        estimator: BandwidthEstimator::new(streaming),
        render_mode: "mesh".to_string(),
    };

    while let Some(frame) = ws_receiver.next().await {
        let message = match frame {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("websocket error for session {client_id}: {e}");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => {
                    dispatch(client_id, room_id, hub, outbound, &mut state, parsed, streaming).await;
                }
                Err(e) => {
                    tracing::debug!("protocol error from session {client_id}: {e}");
                }
            },
            Message::Binary(_) => {
                // No inbound binary stream type is currently defined on the wire; a binary
                // frame never has a pending expectation to match, so it's a protocol error.
                tracing::debug!("unexpected inbound binary frame from session {client_id}, dropping");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn dispatch(
    client_id: &str,
    room_id: &str,
    hub: &Arc<Hub>,
    outbound: &mpsc::Sender<OutboundFrame>,
    state: &mut SessionState,
    message: ClientMessage,
    streaming: StreamingConfig,
) {
    match message {
        ClientMessage::Signal { signal } => {
            hub.broadcast_room(
                room_id,
                ServerMessage::Signal {
                    from: client_id.to_string(),
                    signal,
                },
                Some(client_id),
            );
        }

        ClientMessage::ListAssets => {
            let assets: Vec<_> = hub
                .assets
                .list()
                .into_iter()
                .map(|(id, lods, has_nerf)| {
                    serde_json::json!({ "id": id, "lods": lods, "hasNerf": has_nerf })
                })
                .collect();
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::AssetList {
                    assets: serde_json::Value::Array(assets),
                }))
                .await;
        }

        ClientMessage::RequestAsset { asset_id, lod, position } => {
            stream_asset(hub, outbound, asset_id, lod, position, state, streaming.chunk_size).await;
        }

        ClientMessage::RequestNerf { asset_id, options } => {
            stream_nerf(hub, outbound, asset_id, options, streaming).await;
        }

        ClientMessage::SetRenderMode { mode } => {
            if RENDER_MODES.contains(&mode.as_str()) {
                state.render_mode = mode;
            } else {
                let _ = outbound
                    .send(OutboundFrame::Text(ServerMessage::NerfError {
                        asset_id: None,
                        error: format!("invalid render mode: {mode}"),
                    }))
                    .await;
            }
        }

        ClientMessage::BandwidthMetrics { metrics } => {
            state.estimator.observe_client(metrics.bandwidth);
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::LodRecommendation {
                    lod: state.estimator.recommend(),
                }))
                .await;
        }

        ClientMessage::HeadTracking {
            position,
            rotation,
            quaternion,
            ..
        } => {
            update_pose(client_id, room_id, hub, state, position, rotation, quaternion);
        }

        ClientMessage::PositionUpdate {
            position,
            rotation,
            quaternion,
        } => {
            update_pose(client_id, room_id, hub, state, position, rotation, quaternion);
        }

        ClientMessage::GetRoomObjects { room_id: requested_room } => {
            let objects = hub.objects.objects_in_room(&requested_room);
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::RoomObjects {
                    objects: serde_json::to_value(objects).unwrap_or(serde_json::Value::Null),
                }))
                .await;
        }

        ClientMessage::CreateObject { room_id: target_room, object_data } => {
            let object = hub.objects.create(&target_room, object_data, client_id);
            hub.broadcast_room(
                &target_room,
                ServerMessage::ObjectCreated {
                    object: serde_json::to_value(&object).unwrap_or(serde_json::Value::Null),
                },
                None,
            );
        }

        ClientMessage::UpdateObject { room_id: target_room, object_id, updates } => {
            if let Some(object) = hub.objects.update(&target_room, object_id, updates, client_id) {
                hub.broadcast_room(
                    &target_room,
                    ServerMessage::ObjectUpdated {
                        object: serde_json::to_value(&object).unwrap_or(serde_json::Value::Null),
                    },
                    None,
                );
            }
        }

        ClientMessage::DeleteObject { room_id: target_room, object_id } => {
            if hub.objects.delete(&target_room, object_id) {
                hub.broadcast_room(&target_room, ServerMessage::ObjectDeleted { object_id }, None);
            }
        }

        ClientMessage::GrabObject { room_id: target_room, object_id } => {
            match hub.objects.grab(&target_room, object_id, client_id) {
                GrabOutcome::Granted(object) => {
                    hub.broadcast_room(
                        &target_room,
                        ServerMessage::ObjectGrabbed {
                            object_id,
                            user_id: client_id.to_string(),
                            object: serde_json::to_value(&object).unwrap_or(serde_json::Value::Null),
                        },
                        None,
                    );
                }
                GrabOutcome::Denied { owned_by } => {
                    let _ = outbound
                        .send(OutboundFrame::Text(ServerMessage::GrabFailed { object_id, owned_by }))
                        .await;
                }
                GrabOutcome::NotFound => {
                    tracing::debug!("grab-object for unknown object {object_id} in room {target_room}");
                }
            }
        }

        ClientMessage::ReleaseObject { room_id: target_room, object_id } => {
            if hub.objects.release(&target_room, object_id, client_id).is_some() {
                hub.broadcast_room(
                    &target_room,
                    ServerMessage::ObjectReleased {
                        object_id,
                        user_id: client_id.to_string(),
                    },
                    None,
                );
            }
        }

        ClientMessage::MoveObject { room_id: target_room, object_id, position, rotation } => {
            if let Some(_object) = hub.objects.move_object(&target_room, object_id, client_id, position, rotation) {
                hub.broadcast_room(
                    &target_room,
                    ServerMessage::ObjectMoved {
                        object_id,
                        position,
                        rotation,
                        user_id: client_id.to_string(),
                    },
                    Some(client_id),
                );
            }
        }

        ClientMessage::SetSimulationMode { enabled } => {
            if enabled {
                state.estimator.set_forced_tier(Some(Lod::Low));
            } else {
                state.estimator.set_forced_tier(None);
            }
            let lod = if enabled { Some(Lod::Low) } else { None };
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::SimulationModeChanged { enabled, lod }))
                .await;
            if !enabled {
                let _ = outbound
                    .send(OutboundFrame::Text(ServerMessage::LodRecommendation {
                        lod: state.estimator.recommend(),
                    }))
                    .await;
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = outbound.send(OutboundFrame::Text(ServerMessage::Pong { timestamp })).await;
        }
    }
}

fn update_pose(
    client_id: &str,
    room_id: &str,
    hub: &Arc<Hub>,
    state: &mut SessionState,
    position: Vec3,
    rotation: Vec3,
    quaternion: Option<[f32; 4]>,
) {
    let yaw_radians = rotation[1];
    state.pose = Some(foveation::Pose {
        position: nalgebra::Vector3::new(position[0], position[1], position[2]),
        yaw_radians,
    });

    hub.rooms.update_pose(
        client_id,
        rooms::Pose {
            position,
            rotation,
            quaternion,
        },
    );

    hub.broadcast_room(
        room_id,
        ServerMessage::UserPosition {
            user_id: client_id.to_string(),
            position,
            rotation,
            quaternion,
        },
        Some(client_id),
    );
}

/// Resolve a LOD (foveated selector first, bandwidth estimator fallback), fetch bytes off the
/// async executor's blocking pool, then emit metadata + chunk pairs + completion.
async fn stream_asset(
    hub: &Arc<Hub>,
    outbound: &mpsc::Sender<OutboundFrame>,
    asset_id: String,
    requested_lod: Option<Lod>,
    position: Option<Vec3>,
    state: &mut SessionState,
    chunk_size: usize,
) {
    let selection = position.map(|p| nalgebra::Vector3::new(p[0], p[1], p[2]))
        .and_then(|p| foveation::recommend(state.pose, p));

    let effective_lod = match selection {
        Some(Selection::Skip) => {
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::AssetSkipped {
                    asset_id,
                    reason: "outside the viewer's foveated field".to_string(),
                }))
                .await;
            return;
        }
        Some(Selection::Lod(lod)) => lod,
        None => requested_lod.unwrap_or_else(|| state.estimator.recommend()),
    };

    let hub_clone = hub.clone();
    let lookup_id = asset_id.clone();
    let fetch = tokio::task::spawn_blocking(move || hub_clone.assets.get(&lookup_id, effective_lod)).await;

    let (bytes, served_lod) = match fetch {
        Ok(Ok(pair)) => pair,
        _ => {
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::AssetError {
                    asset_id,
                    error: "asset not found".to_string(),
                }))
                .await;
            return;
        }
    };

    let size = bytes.len() as u64;
    let chunks = chunk_count(size, chunk_size);
    let _ = outbound
        .send(OutboundFrame::Text(ServerMessage::AssetMetadata {
            asset_id: asset_id.clone(),
            lod: served_lod,
            size,
            chunks,
        }))
        .await;

    let start = Instant::now();
    for i in 0..chunks {
        let begin = i as usize * chunk_size;
        let end = ((i as usize + 1) * chunk_size).min(bytes.len());
        let header = ServerMessage::AssetChunk {
            asset_id: asset_id.clone(),
            chunk_index: i,
            total_chunks: chunks,
        };
        if outbound
            .send(OutboundFrame::Pair(header, bytes[begin..end].to_vec()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = outbound
        .send(OutboundFrame::Text(ServerMessage::AssetComplete { asset_id }))
        .await;

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        state.estimator.observe_server(size, elapsed);
    }
}

async fn stream_nerf(
    hub: &Arc<Hub>,
    outbound: &mpsc::Sender<OutboundFrame>,
    asset_id: String,
    options: Option<crate::protocol::NerfOptions>,
    streaming: StreamingConfig,
) {
    let throttle = options.map(|o| o.throttle).unwrap_or(false);

    let hub_clone = hub.clone();
    let lookup_id = asset_id.clone();
    let fetch = tokio::task::spawn_blocking(move || hub_clone.assets.get_nerf(&lookup_id)).await;

    let (format, bytes) = match fetch {
        Ok(Ok(Some(pair))) => pair,
        Ok(Ok(None)) => {
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::NerfError {
                    asset_id: Some(asset_id),
                    error: "no NeRF asset for this id".to_string(),
                }))
                .await;
            return;
        }
        _ => {
            let _ = outbound
                .send(OutboundFrame::Text(ServerMessage::NerfError {
                    asset_id: Some(asset_id),
                    error: "asset not found".to_string(),
                }))
                .await;
            return;
        }
    };

    let chunk_size = streaming.chunk_size;
    let size = bytes.len() as u64;
    let chunks = chunk_count(size, chunk_size);
    let _ = outbound
        .send(OutboundFrame::Text(ServerMessage::NerfMetadata {
            asset_id: asset_id.clone(),
            format: format.as_str().to_string(),
            size,
            chunks,
        }))
        .await;

    for i in 0..chunks {
        let begin = i as usize * chunk_size;
        let end = ((i as usize + 1) * chunk_size).min(bytes.len());
        let header = ServerMessage::NerfChunk {
            asset_id: asset_id.clone(),
            chunk_index: i,
            total_chunks: chunks,
            offset: begin as u64,
            size: (end - begin) as u64,
        };
        if outbound
            .send(OutboundFrame::Pair(header, bytes[begin..end].to_vec()))
            .await
            .is_err()
        {
            return;
        }
        if throttle && streaming.nerf_throttle_every > 0 && (i + 1) as usize % streaming.nerf_throttle_every == 0 {
            tokio::time::sleep(streaming.nerf_throttle_pause).await;
        }
    }

    let _ = outbound
        .send(OutboundFrame::Text(ServerMessage::NerfComplete {
            asset_id,
            total_size: size,
            chunks_transferred: chunks,
        }))
        .await;
}

fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if size == 0 {
        0
    } else {
        (size + chunk_size as u64 - 1) / chunk_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_zero_size_has_zero_chunks() {
        assert_eq!(chunk_count(0, 16_384), 0);
    }

    #[test]
    fn boundary_exact_multiple_has_no_remainder_chunk() {
        assert_eq!(chunk_count(16_384 * 3, 16_384), 3);
    }

    #[test]
    fn boundary_one_byte_over_adds_a_chunk() {
        assert_eq!(chunk_count(16_384 * 3 + 1, 16_384), 4);
    }

    fn tiny_glb() -> Vec<u8> {
        let json = r#"{"asset":{"version":"2.0"}}"#.as_bytes().to_vec();
        let glb = gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: 0,
            },
            json: std::borrow::Cow::Owned(json),
            bin: None,
        };
        glb.to_vec().unwrap()
    }

    fn test_hub() -> (tempfile::TempDir, tempfile::TempDir, Arc<Hub>) {
        let asset_root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let cube_dir = asset_root.path().join("cube");
        std::fs::create_dir_all(&cube_dir).unwrap();
        std::fs::write(cube_dir.join("high.glb"), tiny_glb()).unwrap();

        let server_config = crate::config::ServerConfig {
            asset_root: asset_root.path().to_path_buf(),
            cache_root: cache_root.path().to_path_buf(),
            ..Default::default()
        };
        let hub = crate::build_hub(&server_config).unwrap();
        (asset_root, cache_root, hub)
    }

    async fn drain_text(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerMessage {
        loop {
            match rx.recv().await.expect("channel closed before expected message") {
                OutboundFrame::Text(m) => return m,
                OutboundFrame::Binary(_) => continue,
                OutboundFrame::Pair(m, _) => return m,
            }
        }
    }

    /// Cold start with no bandwidth samples resolves to LOW (minimum sample count unmet).
    #[tokio::test]
    async fn cold_start_resolves_low() {
        let (_a, _c, hub) = test_hub();
        let (tx, mut rx) = mpsc::channel(64);
        let mut state = SessionState {
            pose: None,
            estimator: BandwidthEstimator::new(StreamingConfig::default()),
            render_mode: "mesh".to_string(),
        };

        dispatch(
            "alice",
            "default",
            &hub,
            &tx,
            &mut state,
            ClientMessage::RequestAsset { asset_id: "cube".to_string(), lod: None, position: None },
            StreamingConfig::default(),
        )
        .await;

        match drain_text(&mut rx).await {
            ServerMessage::AssetMetadata { lod, .. } => assert_eq!(lod, Lod::Low),
            other => panic!("expected asset_metadata, got {other:?}"),
        }
    }

    /// Two high-bandwidth reports warm the estimator past the minimum sample count; the next request
    /// resolves HIGH and each report already yielded its own `lod-recommendation`.
    #[tokio::test]
    async fn high_bandwidth_resolves_high_after_warmup() {
        let (_a, _c, hub) = test_hub();
        let (tx, mut rx) = mpsc::channel(64);
        let mut state = SessionState {
            pose: None,
            estimator: BandwidthEstimator::new(StreamingConfig::default()),
            render_mode: "mesh".to_string(),
        };

        for _ in 0..2 {
            dispatch(
                "alice",
                "default",
                &hub,
                &tx,
                &mut state,
                ClientMessage::BandwidthMetrics {
                    metrics: crate::protocol::BandwidthMetrics { bandwidth: 1_500_000.0, bytes_received: None, timestamp: None },
                },
                StreamingConfig::default(),
            )
            .await;
        }
        match drain_text(&mut rx).await {
            ServerMessage::LodRecommendation { .. } => {}
            other => panic!("expected lod-recommendation, got {other:?}"),
        }
        match drain_text(&mut rx).await {
            ServerMessage::LodRecommendation { lod } => assert_eq!(lod, Lod::High),
            other => panic!("expected lod-recommendation, got {other:?}"),
        }

        dispatch(
            "alice",
            "default",
            &hub,
            &tx,
            &mut state,
            ClientMessage::RequestAsset { asset_id: "cube".to_string(), lod: None, position: None },
            StreamingConfig::default(),
        )
        .await;
        match drain_text(&mut rx).await {
            ServerMessage::AssetMetadata { lod, .. } => assert_eq!(lod, Lod::High),
            other => panic!("expected asset_metadata, got {other:?}"),
        }
    }

    /// Facing +Z (yaw = pi), an asset placed behind the viewer is skipped with no binary
    /// frames sent.
    #[tokio::test]
    async fn foveated_skip_sends_no_binary_frames() {
        let (_a, _c, hub) = test_hub();
        let (tx, mut rx) = mpsc::channel(64);
        let mut state = SessionState {
            pose: None,
            estimator: BandwidthEstimator::new(StreamingConfig::default()),
            render_mode: "mesh".to_string(),
        };

        dispatch(
            "alice",
            "default",
            &hub,
            &tx,
            &mut state,
            ClientMessage::HeadTracking {
                position: [0.0, 0.0, 0.0],
                rotation: [0.0, std::f32::consts::PI, 0.0],
                quaternion: None,
                fov: 90.0,
                timestamp: None,
            },
            StreamingConfig::default(),
        )
        .await;
        // head-tracking only broadcasts to room peers (none here); alice's own queue stays empty.

        dispatch(
            "alice",
            "default",
            &hub,
            &tx,
            &mut state,
            ClientMessage::RequestAsset {
                asset_id: "cube".to_string(),
                lod: None,
                position: Some([0.0, 0.0, -2.0]),
            },
            StreamingConfig::default(),
        )
        .await;

        match rx.try_recv() {
            Ok(OutboundFrame::Text(ServerMessage::AssetSkipped { asset_id, .. })) => {
                assert_eq!(asset_id, "cube");
            }
            other => panic!("expected asset_skipped, got {other:?}"),
        }
    }
}
