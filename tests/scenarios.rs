//! Broader scenario tests driving the Hub and component APIs directly (no real socket required —
//! `Hub::join` accepts an abstract outbound channel per session).

use std::time::Duration;

use streamxr_core::config::ServerConfig;
use streamxr_core::hub::OutboundFrame;
use streamxr_core::objects::GrabOutcome;
use streamxr_core::protocol::{ObjectData, ServerMessage};
use tokio::sync::mpsc;

fn test_server_config(asset_root: &std::path::Path, cache_root: &std::path::Path) -> ServerConfig {
    ServerConfig {
        asset_root: asset_root.to_path_buf(),
        cache_root: cache_root.to_path_buf(),
        ..Default::default()
    }
}

fn object_data(kind: &str) -> ObjectData {
    ObjectData {
        kind: kind.to_string(),
        position: Some([0.0, 0.0, 0.0]),
        rotation: None,
        scale: None,
        color: None,
    }
}

async fn next_text(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerMessage {
    match rx.recv().await.expect("channel closed unexpectedly") {
        OutboundFrame::Text(m) => m,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Grab contention: two sessions race for the same object. The winner sees
/// `object-grabbed`; the loser sees `grab-failed` naming the winner.
#[tokio::test]
async fn grab_contention_winner_and_loser() {
    let asset_root = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let hub = streamxr_core::build_hub(&test_server_config(asset_root.path(), cache_root.path())).unwrap();

    let (tx_a, mut rx_a) = mpsc::channel(32);
    let (tx_b, mut rx_b) = mpsc::channel(32);
    hub.join("a", tx_a);
    hub.join("b", tx_b);
    // "b" joining broadcast a peer-connected notification to "a"; drain it before the grab race.
    let _ = rx_a.try_recv();

    let object = hub.objects.create("default", object_data("cube"), "a");

    match hub.objects.grab("default", object.id, "a") {
        GrabOutcome::Granted(_) => {
            hub.broadcast_room(
                "default",
                ServerMessage::ObjectGrabbed {
                    object_id: object.id,
                    user_id: "a".to_string(),
                    object: serde_json::Value::Null,
                },
                None,
            );
        }
        other => panic!("expected grant for first grab, got {other:?}"),
    }
    match next_text(&mut rx_a).await {
        ServerMessage::ObjectGrabbed { user_id, .. } => assert_eq!(user_id, "a"),
        other => panic!("expected object-grabbed, got {other:?}"),
    }

    match hub.objects.grab("default", object.id, "b") {
        GrabOutcome::Denied { owned_by } => assert_eq!(owned_by, "a"),
        other => panic!("expected denial for second grab, got {other:?}"),
    }
}

/// Idle release: an object grabbed and then left untouched is auto-released within
/// `[OWNERSHIP_TIMEOUT, OWNERSHIP_TIMEOUT + 500ms]` of the grab, broadcast to the room naming the
/// grabber as the released owner even when a different session created the object.
#[tokio::test(start_paused = true)]
async fn idle_release_fires_within_window() {
    let asset_root = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let hub = streamxr_core::build_hub(&test_server_config(asset_root.path(), cache_root.path())).unwrap();

    let (tx_a, mut rx_a) = mpsc::channel(32);
    let (tx_b, mut rx_b) = mpsc::channel(32);
    hub.join("a", tx_a);
    hub.join("b", tx_b);
    // "b" joining broadcast a peer-connected notification to "a"; drain it before arming the timer.
    let _ = rx_a.try_recv();

    let object = hub.objects.create("default", object_data("sphere"), "b");
    match hub.objects.grab("default", object.id, "a") {
        GrabOutcome::Granted(_) => {}
        other => panic!("expected grant, got {other:?}"),
    }

    tokio::time::advance(Duration::from_millis(5100)).await;

    match next_text(&mut rx_a).await {
        ServerMessage::ObjectReleased { object_id, user_id } => {
            assert_eq!(object_id, object.id);
            assert_eq!(user_id, "a");
        }
        other => panic!("expected object-released, got {other:?}"),
    }
    match next_text(&mut rx_b).await {
        ServerMessage::ObjectReleased { object_id, user_id } => {
            assert_eq!(object_id, object.id);
            assert_eq!(user_id, "a");
        }
        other => panic!("expected object-released, got {other:?}"),
    }
}

/// Disconnect sweep: a session that vanishes while owning two objects releases both, and
/// its room peer sees both releases plus a `peer-disconnected`.
#[tokio::test]
async fn disconnect_releases_all_owned_objects() {
    let asset_root = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let hub = streamxr_core::build_hub(&test_server_config(asset_root.path(), cache_root.path())).unwrap();

    let (tx_a, _rx_a) = mpsc::channel(32);
    let (tx_b, mut rx_b) = mpsc::channel(32);
    hub.join("a", tx_a);
    hub.join("b", tx_b);

    let x = hub.objects.create("default", object_data("cube"), "a");
    let y = hub.objects.create("default", object_data("cone"), "a");
    assert!(matches!(hub.objects.grab("default", x.id, "a"), GrabOutcome::Granted(_)));
    assert!(matches!(hub.objects.grab("default", y.id, "a"), GrabOutcome::Granted(_)));

    hub.leave("a");

    let mut released = Vec::new();
    let mut saw_disconnect = false;
    for _ in 0..3 {
        match next_text(&mut rx_b).await {
            ServerMessage::ObjectReleased { object_id, .. } => released.push(object_id),
            ServerMessage::PeerDisconnected { peer_id } => {
                assert_eq!(peer_id, "a");
                saw_disconnect = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    released.sort();
    let mut expected = vec![x.id, y.id];
    expected.sort();
    assert_eq!(released, expected);
    assert!(saw_disconnect);
}

/// Create followed by delete leaves the room's object set unchanged.
#[tokio::test]
async fn invariant_create_then_delete_round_trips() {
    let asset_root = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let hub = streamxr_core::build_hub(&test_server_config(asset_root.path(), cache_root.path())).unwrap();

    let before = hub.objects.objects_in_room("default").len();
    let object = hub.objects.create("default", object_data("cube"), "a");
    assert!(hub.objects.delete("default", object.id));
    assert_eq!(hub.objects.objects_in_room("default").len(), before);
}

/// Grab then release by the same client leaves ownership unset.
#[tokio::test]
async fn invariant_grab_then_release_clears_ownership() {
    let asset_root = tempfile::tempdir().unwrap();
    let cache_root = tempfile::tempdir().unwrap();
    let hub = streamxr_core::build_hub(&test_server_config(asset_root.path(), cache_root.path())).unwrap();

    let object = hub.objects.create("default", object_data("cube"), "a");
    assert!(matches!(hub.objects.grab("default", object.id, "a"), GrabOutcome::Granted(_)));
    let released = hub.objects.release("default", object.id, "a").unwrap();
    assert!(released.owned_by.is_none());
}
