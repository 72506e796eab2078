//! Room Registry (C5).
//!
//! Users <-> rooms, per-user pose snapshot, per-user colour. One lock per registry (rooms are
//! small and short-lived relative to the session count, so a single `RwLock<HashMap<...>>` over
//! room membership is a read-mostly shape, rather than a lock per room here).

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;

const COLOR_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff",
];

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Pose {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quaternion: Option<[f32; 4]>,
}

#[derive(Debug, Clone)]
struct Member {
    room_id: String,
    pose: Option<Pose>,
}

pub struct RoomRegistry {
    default_room: String,
    members: RwLock<HashMap<String, Member>>,
    rooms: RwLock<HashMap<String, Vec<String>>>,
}

impl RoomRegistry {
    pub fn new(default_room: String) -> Self {
        Self {
            default_room,
            members: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Assigns `client_id` to the default room, picks a colour, and returns the room id, the
    /// existing peer list (before this client was added), and the assigned colour.
    pub fn add(&self, client_id: &str) -> (String, Vec<String>, &'static str) {
        let room_id = self.default_room.clone();
        let color = COLOR_PALETTE
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("#ffffff");

        let peers = {
            let mut rooms = self.rooms.write();
            let entry = rooms.entry(room_id.clone()).or_default();
            let peers = entry.clone();
            entry.push(client_id.to_string());
            peers
        };

        self.members.write().insert(
            client_id.to_string(),
            Member {
                room_id: room_id.clone(),
                pose: None,
            },
        );

        (room_id, peers, color)
    }

    /// Detaches `client_id` from its room. Empty rooms are dropped.
    pub fn remove(&self, client_id: &str) {
        let Some(member) = self.members.write().remove(client_id) else {
            return;
        };
        let mut rooms = self.rooms.write();
        if let Some(peers) = rooms.get_mut(&member.room_id) {
            peers.retain(|id| id != client_id);
            if peers.is_empty() {
                rooms.remove(&member.room_id);
            }
        }
    }

    pub fn update_pose(&self, client_id: &str, pose: Pose) {
        if let Some(member) = self.members.write().get_mut(client_id) {
            member.pose = Some(pose);
        }
    }

    pub fn room_of(&self, client_id: &str) -> Option<String> {
        self.members.read().get(client_id).map(|m| m.room_id.clone())
    }

    /// Other members of `client_id`'s room.
    pub fn peers_of(&self, client_id: &str) -> Vec<String> {
        let Some(room_id) = self.room_of(client_id) else {
            return Vec::new();
        };
        self.rooms
            .read()
            .get(&room_id)
            .map(|members| members.iter().filter(|id| id.as_str() != client_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        self.rooms.read().get(room_id).cloned().unwrap_or_default()
    }

    /// Snapshot of every known user's pose, keyed by client id, for the `welcome` payload.
    pub fn all_poses(&self) -> HashMap<String, Pose> {
        self.members
            .read()
            .iter()
            .filter_map(|(id, m)| m.pose.map(|p| (id.clone(), p)))
            .collect()
    }
}
