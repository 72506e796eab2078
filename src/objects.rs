//! Object Registry (C6).
//!
//! Per-room map of shared objects with single-owner grab semantics and an idle-timeout
//! auto-release. Grab/Release/Move/timer-expiry serialise under one lock per room (`DashMap` of
//! `Mutex`-guarded room state) so contention never needs a global lock, only per-room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ObjectRegistryConfig;
use crate::protocol::{ObjectData, ObjectPatch, Vec3};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedObject {
    pub id: u64,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
    #[serde(rename = "ownedBy", skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(rename = "ownershipExpiresAt", skip_serializing_if = "Option::is_none")]
    pub ownership_expires_at: Option<u64>,
}

struct ObjectEntry {
    object: SharedObject,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RoomState {
    objects: HashMap<u64, ObjectEntry>,
}

#[derive(Debug)]
pub enum GrabOutcome {
    Granted(SharedObject),
    Denied { owned_by: String },
    NotFound,
}

/// Events the idle-timeout timer emits from its own async task, since nothing calls it
/// synchronously; the Hub drains this channel and broadcasts on its caller's behalf.
pub enum RegistryEvent {
    ObjectReleased {
        room_id: String,
        object: SharedObject,
        owner: String,
    },
}

pub struct ObjectRegistry {
    weak: Weak<ObjectRegistry>,
    config: ObjectRegistryConfig,
    rooms: dashmap::DashMap<String, Mutex<RoomState>>,
    counter: AtomicU64,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ObjectRegistry {
    pub fn new(
        config: ObjectRegistryConfig,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            rooms: dashmap::DashMap::new(),
            counter: AtomicU64::new(0),
            events,
        })
    }

    fn next_object_id(&self) -> u64 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        (now_millis() << 20) | (counter & 0xF_FFFF)
    }

    pub fn objects_in_room(&self, room_id: &str) -> Vec<SharedObject> {
        self.rooms
            .get(room_id)
            .map(|room| room.lock().objects.values().map(|e| e.object.clone()).collect())
            .unwrap_or_default()
    }

    pub fn create(&self, room_id: &str, data: ObjectData, created_by: &str) -> SharedObject {
        let id = self.next_object_id();
        let now = now_millis();
        let object = SharedObject {
            id,
            kind: data.kind,
            position: data.position,
            rotation: data.rotation,
            scale: data.scale,
            color: data.color,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            owned_by: None,
            ownership_expires_at: None,
        };
        let room = self.rooms.entry(room_id.to_string()).or_default();
        room.lock().objects.insert(
            id,
            ObjectEntry {
                object: object.clone(),
                timer: None,
            },
        );
        object
    }

    /// Merges permitted fields. Returns `None` if the object doesn't exist, or silently if it's
    /// owned by someone other than `requester`.
    pub fn update(&self, room_id: &str, object_id: u64, patch: ObjectPatch, requester: &str) -> Option<SharedObject> {
        let room = self.rooms.get(room_id)?;
        let mut room = room.lock();
        let entry = room.objects.get_mut(&object_id)?;
        if let Some(owner) = &entry.object.owned_by {
            if owner != requester {
                tracing::debug!("ignoring update to object {object_id} by non-owner {requester}");
                return None;
            }
        }
        if patch.position.is_some() {
            entry.object.position = patch.position;
        }
        if patch.rotation.is_some() {
            entry.object.rotation = patch.rotation;
        }
        if patch.scale.is_some() {
            entry.object.scale = patch.scale;
        }
        if patch.color.is_some() {
            entry.object.color = patch.color;
        }
        entry.object.updated_at = now_millis();
        Some(entry.object.clone())
    }

    pub fn delete(&self, room_id: &str, object_id: u64) -> bool {
        let Some(room) = self.rooms.get(room_id) else {
            return false;
        };
        let mut room = room.lock();
        if let Some(entry) = room.objects.remove(&object_id) {
            if let Some(handle) = entry.timer {
                handle.abort();
            }
            true
        } else {
            false
        }
    }

    pub fn grab(&self, room_id: &str, object_id: u64, client_id: &str) -> GrabOutcome {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        let mut room = room.lock();
        let Some(entry) = room.objects.get_mut(&object_id) else {
            return GrabOutcome::NotFound;
        };
        if let Some(owner) = &entry.object.owned_by {
            if owner != client_id {
                return GrabOutcome::Denied {
                    owned_by: owner.clone(),
                };
            }
        }
        entry.object.owned_by = Some(client_id.to_string());
        entry.object.updated_at = now_millis();
        self.rearm_timer(&mut entry.timer, room_id.to_string(), object_id);
        entry.object.ownership_expires_at =
            Some(entry.object.updated_at + self.config.ownership_timeout.as_millis() as u64);
        GrabOutcome::Granted(entry.object.clone())
    }

    pub fn release(&self, room_id: &str, object_id: u64, client_id: &str) -> Option<SharedObject> {
        let room = self.rooms.get(room_id)?;
        let mut room = room.lock();
        let entry = room.objects.get_mut(&object_id)?;
        if entry.object.owned_by.as_deref() != Some(client_id) {
            return None;
        }
        entry.object.owned_by = None;
        entry.object.ownership_expires_at = None;
        entry.object.updated_at = now_millis();
        if let Some(handle) = entry.timer.take() {
            handle.abort();
        }
        Some(entry.object.clone())
    }

    /// Same authorisation as `update`; additionally re-arms the idle timer. This is the hot path
    /// run at pose-update cadence.
    pub fn move_object(&self, room_id: &str, object_id: u64, client_id: &str, position: Vec3, rotation: Vec3) -> Option<SharedObject> {
        let room = self.rooms.get(room_id)?;
        let mut room = room.lock();
        let entry = room.objects.get_mut(&object_id)?;
        if let Some(owner) = &entry.object.owned_by {
            if owner != client_id {
                return None;
            }
        }
        entry.object.position = Some(position);
        entry.object.rotation = Some(rotation);
        entry.object.updated_at = now_millis();
        if entry.object.owned_by.is_some() {
            self.rearm_timer(&mut entry.timer, room_id.to_string(), object_id);
            entry.object.ownership_expires_at =
                Some(entry.object.updated_at + self.config.ownership_timeout.as_millis() as u64);
        }
        Some(entry.object.clone())
    }

    /// Unconditionally releases every object owned by `client_id`, across every room. Called on
    /// session teardown.
    pub fn release_all_owned_by(&self, client_id: &str) -> Vec<(String, SharedObject)> {
        let mut released = Vec::new();
        for room_ref in self.rooms.iter() {
            let room_id = room_ref.key().clone();
            let mut room = room_ref.value().lock();
            for entry in room.objects.values_mut() {
                if entry.object.owned_by.as_deref() == Some(client_id) {
                    entry.object.owned_by = None;
                    entry.object.ownership_expires_at = None;
                    entry.object.updated_at = now_millis();
                    if let Some(handle) = entry.timer.take() {
                        handle.abort();
                    }
                    released.push((room_id.clone(), entry.object.clone()));
                }
            }
        }
        released
    }

    fn rearm_timer(&self, slot: &mut Option<JoinHandle<()>>, room_id: String, object_id: u64) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let weak = self.weak.clone();
        let timeout = self.config.ownership_timeout;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = weak.upgrade() {
                registry.fire_timeout(&room_id, object_id);
            }
        }));
    }

    fn fire_timeout(&self, room_id: &str, object_id: u64) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let (released, owner) = {
            let mut room = room.lock();
            let Some(entry) = room.objects.get_mut(&object_id) else {
                return;
            };
            let Some(owner) = entry.object.owned_by.clone() else {
                return;
            };
            entry.object.owned_by = None;
            entry.object.ownership_expires_at = None;
            entry.object.updated_at = now_millis();
            entry.timer = None;
            (entry.object.clone(), owner)
        };
        let _ = self.events.send(RegistryEvent::ObjectReleased {
            room_id: room_id.to_string(),
            object: released,
            owner,
        });
    }
}
