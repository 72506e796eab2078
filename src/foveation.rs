//! Foveated Selector (C4).
//!
//! Picks a per-object LOD (or SKIP) from the angle between the viewer's gaze direction and the
//! direction to the object, plus distance — deriving a view-relative vector from yaw before doing
//! anything else with it, the way camera-facing code typically does.

use nalgebra::Vector3;

use crate::protocol::Lod;

const FOVEAL_DEG: f32 = 15.0;
const PERIPHERAL_DEG: f32 = 60.0;
const FAR_PERIPHERAL_DEG: f32 = 90.0;

const PERIPHERAL_DISTANCE: f32 = 30.0;
const FAR_PERIPHERAL_DISTANCE: f32 = 5.0;

/// What C4 recommends for a single object: a concrete tier, or SKIP (don't stream it at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Lod(Lod),
    Skip,
}

/// A viewer pose: position plus a yaw angle (radians, 0 = +Z forward) derived from head rotation.
/// Pitch is tracked only for completeness; horizontal-FOV zone math ignores it.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub yaw_radians: f32,
}

fn view_vector(yaw_radians: f32) -> Vector3<f32> {
    Vector3::new(yaw_radians.sin(), 0.0, -yaw_radians.cos())
}

/// Returns the recommendation for an object at `object_position`, given the viewer's `pose`.
/// Returns `None` ("no opinion") when no pose has been reported yet; callers fall back to C3.
pub fn recommend(pose: Option<Pose>, object_position: Vector3<f32>) -> Option<Selection> {
    let pose = pose?;
    let offset = object_position - pose.position;
    let distance = offset.norm();
    if distance < 1e-6 {
        return Some(Selection::Lod(Lod::High));
    }
    let direction = offset / distance;
    let view = view_vector(pose.yaw_radians);

    let cos_angle = view.dot(&direction).clamp(-1.0, 1.0);
    let angle_deg = cos_angle.acos().to_degrees();

    let selection = if angle_deg > FAR_PERIPHERAL_DEG {
        Selection::Skip
    } else if angle_deg <= FOVEAL_DEG {
        Selection::Lod(Lod::High)
    } else if angle_deg <= PERIPHERAL_DEG {
        if distance < PERIPHERAL_DISTANCE {
            Selection::Lod(Lod::Low)
        } else {
            Selection::Skip
        }
    } else {
        // angle_deg <= FAR_PERIPHERAL_DEG
        if distance < FAR_PERIPHERAL_DISTANCE {
            Selection::Lod(Lod::Low)
        } else {
            Selection::Skip
        }
    };
    Some(selection)
}
