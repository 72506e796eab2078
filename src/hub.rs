//! Hub / Router (C8).
//!
//! Process-wide singleton holding C2-C6 and the set of live sessions. The only place broadcasts
//! originate from — individual Session Brokers never reach into each other's write paths. Services
//! are injected into the Hub rather than reached for as free-standing globals, so tests can build
//! a Hub from fakes instead of relying on process-wide state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::asset::AssetManager;
use crate::config::{ObjectRegistryConfig, ServerConfig};
use crate::objects::{ObjectRegistry, RegistryEvent};
use crate::protocol::ServerMessage;
use crate::rooms::{Pose, RoomRegistry};

/// One outbound item. Kept as an enum (not raw `Message`) so the Hub and session layer never
/// need to know about the transport's frame type — the session's writer task owns that mapping.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(ServerMessage),
    Binary(Vec<u8>),
    /// A text header immediately followed by its binary payload, queued as one item so no other
    /// producer writing to the same session's queue can land between them: the pair is atomic on
    /// the wire.
    Pair(ServerMessage, Vec<u8>),
}

pub type OutboundSender = mpsc::Sender<OutboundFrame>;

pub struct Hub {
    pub assets: AssetManager,
    pub rooms: RoomRegistry,
    pub objects: Arc<ObjectRegistry>,
    sessions: dashmap::DashMap<String, OutboundSender>,
    max_sessions: usize,
}

impl Hub {
    pub fn new(assets: AssetManager, server_config: &ServerConfig, object_config: ObjectRegistryConfig) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<RegistryEvent>();
        let hub = Arc::new(Self {
            assets,
            rooms: RoomRegistry::new(server_config.default_room.clone()),
            objects: ObjectRegistry::new(object_config, events_tx),
            sessions: dashmap::DashMap::new(),
            max_sessions: server_config.max_sessions,
        });

        let weak = Arc::downgrade(&hub);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(hub) = weak.upgrade() else { break };
                match event {
                    RegistryEvent::ObjectReleased { room_id, object, owner } => {
                        hub.broadcast_room(
                            &room_id,
                            ServerMessage::ObjectReleased {
                                object_id: object.id,
                                user_id: owner,
                            },
                            None,
                        );
                    }
                }
            }
        });

        hub
    }

    /// Registers a new session, assigns it a room and colour, and returns the payload for its
    /// `welcome` frame.
    pub fn join(&self, client_id: &str, sender: OutboundSender) -> (String, Vec<String>, &'static str, HashMap<String, Pose>) {
        self.sessions.insert(client_id.to_string(), sender);
        let (room_id, peers, color) = self.rooms.add(client_id);
        let poses = self.rooms.all_poses();

        self.broadcast_room(
            &room_id,
            ServerMessage::PeerConnected {
                peer_id: client_id.to_string(),
                color: color.to_string(),
            },
            Some(client_id),
        );

        (room_id, peers, color, poses)
    }

    /// Full teardown sequence: unregister, leave room, release owned objects, broadcast
    /// `peer-disconnected`.
    pub fn leave(&self, client_id: &str) {
        let room_id = self.rooms.room_of(client_id);
        self.sessions.remove(client_id);
        self.rooms.remove(client_id);

        for (room_id, object) in self.objects.release_all_owned_by(client_id) {
            self.broadcast_room(
                &room_id,
                ServerMessage::ObjectReleased {
                    object_id: object.id,
                    user_id: client_id.to_string(),
                },
                None,
            );
        }

        if let Some(room_id) = room_id {
            self.broadcast_room(
                &room_id,
                ServerMessage::PeerDisconnected {
                    peer_id: client_id.to_string(),
                },
                None,
            );
        }
    }

    pub fn send_to(&self, client_id: &str, message: ServerMessage) {
        if let Some(sender) = self.sessions.get(client_id) {
            if sender.try_send(OutboundFrame::Text(message)).is_err() {
                tracing::warn!("outbound queue full or closed for session {client_id}, dropping message");
            }
        }
    }

    /// Enqueues `message` on every session in `room_id` except `exclude`. Best-effort: a full or
    /// closed outbound queue just drops the message for that one recipient.
    pub fn broadcast_room(&self, room_id: &str, message: ServerMessage, exclude: Option<&str>) {
        for member in self.rooms.members_of(room_id) {
            if Some(member.as_str()) == exclude {
                continue;
            }
            if let Some(sender) = self.sessions.get(&member) {
                if sender.try_send(OutboundFrame::Text(message.clone())).is_err() {
                    tracing::debug!("dropping broadcast to slow/closed session {member}");
                }
            }
        }
    }

    /// Used for asset-lifecycle notifications (`asset_uploaded`, `asset_removed`), sent to every
    /// live session regardless of room.
    pub fn broadcast_all(&self, message: ServerMessage) {
        for entry in self.sessions.iter() {
            if entry.value().try_send(OutboundFrame::Text(message.clone())).is_err() {
                tracing::debug!("dropping global broadcast to slow/closed session {}", entry.key());
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Refuse new connections at accept time once the configured session cap is reached.
    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_sessions
    }
}
