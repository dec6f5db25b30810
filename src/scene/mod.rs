//! Scene module
//!
//! Handles:
//! - The side a neighbor sits on and the coordinate shift between frames
//! - Triangle motion and reflection
//! - Routing departing triangles to neighbor queues
//! - A headless scene that stands in for the renderer

mod headless;
mod physics;

pub use headless::{Scene, SceneConfig, StepReport};
pub use physics::{departure, move_triangle, reflect, GRAVITY, TIME_BETWEEN_PAINTS, TRIANGLE_CENTER_HEIGHT};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::Triangle;

/// Width of one screen in the shared normalized frame (`[-1, 1]`)
pub const SCREEN_WIDTH: f32 = 2.0;

/// Sink into the local scene; any task may append to it
pub type SceneSender = mpsc::UnboundedSender<Triangle>;

/// Outgoing queue for one neighbor
pub type NeighborQueue = mpsc::Sender<Triangle>;

/// One side of a screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Shift applied to `x` of a triangle arriving from the neighbor on this side.
    ///
    /// A triangle leaves the left neighbor past its right edge (`x > 1`) and
    /// must appear at our left edge, so it moves one screen width down.
    pub fn inbound_delta(self) -> f32 {
        match self {
            Side::Left => -SCREEN_WIDTH,
            Side::Right => SCREEN_WIDTH,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Offer a departing triangle to a neighbor queue.
///
/// The triangle is handed back when there is no neighbor or its queue is
/// full or closed; the caller must then reflect it.
pub fn offer(queue: Option<&NeighborQueue>, triangle: Triangle) -> Result<(), Triangle> {
    match queue {
        Some(queue) => queue.try_send(triangle).map_err(|e| e.into_inner()),
        None => Err(triangle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Color;

    #[test]
    fn test_translation_round_trips() {
        // Leaves our right edge, lands on the right neighbor's left edge,
        // then comes back the same way.
        let x = 1.137_f32;
        let on_right_neighbor = x + Side::Left.inbound_delta();
        assert!(on_right_neighbor < -0.8 && on_right_neighbor > -0.9);
        let back = on_right_neighbor + Side::Right.inbound_delta();
        assert!((back - x).abs() <= f32::EPSILON * 4.0);
    }

    #[test]
    fn test_offer_without_queue_hands_back() {
        let t = Triangle::new(1.05, 0.0, Color::new(0.5, 0.5, 0.5)).with_velocity(0.5, 0.0);
        assert_eq!(offer(None, t), Err(t));
    }

    #[test]
    fn test_offer_full_queue_hands_back() {
        let (queue, mut queue_rx) = mpsc::channel(1);
        let first = Triangle::default().with_velocity(0.3, 0.0);
        let second = Triangle::default().with_velocity(0.6, 0.0);

        assert_eq!(offer(Some(&queue), first), Ok(()));
        assert_eq!(offer(Some(&queue), second), Err(second));
        assert_eq!(queue_rx.try_recv().unwrap(), first);
    }
}
