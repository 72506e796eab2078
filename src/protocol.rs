//! The duplex session wire protocol: every text frame is a JSON object tagged by `type`.
//! Modelled as `serde`-tagged enums rather than a free-form `Value`, so that an unrecognised
//! `type` is a deserialization failure (a protocol error) rather than a value that silently
//! matches nothing downstream.

use serde::{Deserialize, Serialize};

pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lod {
    High,
    Medium,
    Low,
}

impl Lod {
    pub fn as_str(self) -> &'static str {
        match self {
            Lod::High => "high",
            Lod::Medium => "medium",
            Lod::Low => "low",
        }
    }
}

impl std::fmt::Display for Lod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectData {
    pub kind: String,
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub rotation: Option<Vec3>,
    #[serde(default)]
    pub scale: Option<Vec3>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectPatch {
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub rotation: Option<Vec3>,
    #[serde(default)]
    pub scale: Option<Vec3>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthMetrics {
    pub bandwidth: f64,
    #[serde(default)]
    pub bytes_received: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NerfOptions {
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub throttle: bool,
}

/// Inbound control messages. Unknown `type` values fail to deserialize into this enum and are
/// handled as a protocol error by the caller rather than by a catch-all variant, so that adding a
/// new message kind is a compile-time-visible match exhaustiveness change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "signal")]
    Signal { signal: serde_json::Value },
    #[serde(rename = "list_assets")]
    ListAssets,
    #[serde(rename = "request_asset")]
    RequestAsset {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(default)]
        lod: Option<Lod>,
        /// World position the asset will be placed at, used by the foveated selector (C4) to
        /// judge viewing angle. Absent when the client doesn't yet know placement (e.g. UI
        /// preview requests) — C4 then has no opinion and C3 decides alone.
        #[serde(default)]
        position: Option<Vec3>,
    },
    #[serde(rename = "request_nerf")]
    RequestNerf {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(default)]
        options: Option<NerfOptions>,
    },
    #[serde(rename = "set_render_mode")]
    SetRenderMode { mode: String },
    #[serde(rename = "bandwidth-metrics")]
    BandwidthMetrics { metrics: BandwidthMetrics },
    #[serde(rename = "head-tracking")]
    HeadTracking {
        position: Vec3,
        rotation: Vec3,
        #[serde(default)]
        quaternion: Option<Vec4>,
        fov: f32,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    #[serde(rename = "position-update")]
    PositionUpdate {
        position: Vec3,
        rotation: Vec3,
        #[serde(default)]
        quaternion: Option<Vec4>,
    },
    #[serde(rename = "get-room-objects")]
    GetRoomObjects {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "create-object")]
    CreateObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectData")]
        object_data: ObjectData,
    },
    #[serde(rename = "update-object")]
    UpdateObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectId")]
        object_id: u64,
        updates: ObjectPatch,
    },
    #[serde(rename = "delete-object")]
    DeleteObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectId")]
        object_id: u64,
    },
    #[serde(rename = "grab-object")]
    GrabObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectId")]
        object_id: u64,
    },
    #[serde(rename = "release-object")]
    ReleaseObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectId")]
        object_id: u64,
    },
    #[serde(rename = "move-object")]
    MoveObject {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "objectId")]
        object_id: u64,
        position: Vec3,
        rotation: Vec3,
    },
    #[serde(rename = "set-simulation-mode")]
    SetSimulationMode { enabled: bool },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Outbound (server -> client) messages. `Clone` lets the Hub fan the same message out to many
/// sessions' outbound queues without re-serializing per recipient.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        id: String,
        peers: Vec<String>,
        color: String,
        #[serde(rename = "userPositions")]
        user_positions: serde_json::Value,
    },
    #[serde(rename = "peer-connected")]
    PeerConnected {
        #[serde(rename = "peerId")]
        peer_id: String,
        color: String,
    },
    #[serde(rename = "peer-disconnected")]
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "signal")]
    Signal {
        from: String,
        signal: serde_json::Value,
    },
    #[serde(rename = "asset_list")]
    AssetList { assets: serde_json::Value },
    #[serde(rename = "asset_metadata")]
    AssetMetadata {
        #[serde(rename = "assetId")]
        asset_id: String,
        lod: Lod,
        size: u64,
        chunks: u64,
    },
    #[serde(rename = "asset_chunk")]
    AssetChunk {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u64,
        #[serde(rename = "totalChunks")]
        total_chunks: u64,
    },
    #[serde(rename = "asset_complete")]
    AssetComplete {
        #[serde(rename = "assetId")]
        asset_id: String,
    },
    #[serde(rename = "asset_skipped")]
    AssetSkipped {
        #[serde(rename = "assetId")]
        asset_id: String,
        reason: String,
    },
    #[serde(rename = "asset_error")]
    AssetError {
        #[serde(rename = "assetId")]
        asset_id: String,
        error: String,
    },
    #[serde(rename = "nerf_metadata")]
    NerfMetadata {
        #[serde(rename = "assetId")]
        asset_id: String,
        format: String,
        size: u64,
        chunks: u64,
    },
    #[serde(rename = "nerf_chunk")]
    NerfChunk {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u64,
        #[serde(rename = "totalChunks")]
        total_chunks: u64,
        offset: u64,
        size: u64,
    },
    #[serde(rename = "nerf_complete")]
    NerfComplete {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(rename = "totalSize")]
        total_size: u64,
        #[serde(rename = "chunksTransferred")]
        chunks_transferred: u64,
    },
    #[serde(rename = "nerf_error")]
    NerfError {
        #[serde(rename = "assetId")]
        asset_id: Option<String>,
        error: String,
    },
    #[serde(rename = "lod-recommendation")]
    LodRecommendation { lod: Lod },
    #[serde(rename = "asset_uploaded")]
    AssetUploaded {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(rename = "lodLevels")]
        lod_levels: Vec<Lod>,
    },
    #[serde(rename = "asset_removed")]
    AssetRemoved {
        #[serde(rename = "assetId")]
        asset_id: String,
    },
    #[serde(rename = "user-position")]
    UserPosition {
        #[serde(rename = "userId")]
        user_id: String,
        position: Vec3,
        rotation: Vec3,
        #[serde(skip_serializing_if = "Option::is_none")]
        quaternion: Option<Vec4>,
    },
    #[serde(rename = "room-objects")]
    RoomObjects { objects: serde_json::Value },
    #[serde(rename = "object-created")]
    ObjectCreated { object: serde_json::Value },
    #[serde(rename = "object-updated")]
    ObjectUpdated { object: serde_json::Value },
    #[serde(rename = "object-deleted")]
    ObjectDeleted {
        #[serde(rename = "objectId")]
        object_id: u64,
    },
    #[serde(rename = "object-grabbed")]
    ObjectGrabbed {
        #[serde(rename = "objectId")]
        object_id: u64,
        #[serde(rename = "userId")]
        user_id: String,
        object: serde_json::Value,
    },
    #[serde(rename = "grab-failed")]
    GrabFailed {
        #[serde(rename = "objectId")]
        object_id: u64,
        #[serde(rename = "ownedBy")]
        owned_by: String,
    },
    #[serde(rename = "object-released")]
    ObjectReleased {
        #[serde(rename = "objectId")]
        object_id: u64,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "object-moved")]
    ObjectMoved {
        #[serde(rename = "objectId")]
        object_id: u64,
        position: Vec3,
        rotation: Vec3,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "simulation-mode-changed")]
    SimulationModeChanged {
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        lod: Option<Lod>,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_asset_without_lod_parses() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"request_asset","assetId":"cube"}"#).unwrap();
        match m {
            ClientMessage::RequestAsset { asset_id, lod, .. } => {
                assert_eq!(asset_id, "cube");
                assert!(lod.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn request_asset_with_lod_parses() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"request_asset","assetId":"cube","lod":"high"}"#)
                .unwrap();
        match m {
            ClientMessage::RequestAsset { lod: Some(Lod::High), .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"not-a-real-type"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn asset_metadata_serializes_with_tag() {
        let msg = ServerMessage::AssetMetadata {
            asset_id: "cube".into(),
            lod: Lod::Low,
            size: 100,
            chunks: 1,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "asset_metadata");
        assert_eq!(v["lod"], "low");
    }
}
