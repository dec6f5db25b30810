//! Triangle motion

use super::Side;
use crate::protocol::Triangle;

pub const GRAVITY: f32 = 0.001;
pub const TIME_BETWEEN_PAINTS: f32 = 0.1;

/// Distance from a triangle's center to its apex
pub const TRIANGLE_CENTER_HEIGHT: f32 = 0.173_205_08; // sqrt(3) * 0.4 / 4

/// Advance a triangle by one paint interval, bouncing off the floor and ceiling.
pub fn move_triangle(t: &mut Triangle) {
    t.dy -= GRAVITY;
    t.x += t.dx * TIME_BETWEEN_PAINTS;
    t.y += t.dy * TIME_BETWEEN_PAINTS;

    let max_y = 1.0 - TRIANGLE_CENTER_HEIGHT;
    if t.y <= -1.0 {
        t.dy = -t.dy;
        t.y = -1.0;
    } else if t.y >= max_y {
        t.dy = -t.dy;
        t.y = max_y;
    }
}

/// Bounce a triangle that could not be handed to a neighbor.
pub fn reflect(mut t: Triangle) -> Triangle {
    t.dx = -t.dx;
    move_triangle(&mut t);
    t
}

/// The side a triangle has left the screen through, if any.
pub fn departure(t: &Triangle) -> Option<Side> {
    if t.x < -1.0 {
        Some(Side::Left)
    } else if t.x > 1.0 {
        Some(Side::Right)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect_only_flips_dx() {
        let start = Triangle {
            x: 1.02,
            y: 0.2,
            dx: 0.4,
            dy: -0.05,
            r: 0.1,
            g: 0.2,
            b: 0.3,
        };

        let mut expected = start;
        expected.dx = -start.dx;
        move_triangle(&mut expected);

        let reflected = reflect(start);
        assert_eq!(reflected, expected);
        assert_eq!(reflected.dx, -0.4);
        // Vertical motion is the same as a plain step.
        let mut plain = start;
        move_triangle(&mut plain);
        assert_eq!(reflected.y, plain.y);
        assert_eq!(reflected.dy, plain.dy);
    }

    #[test]
    fn test_reflect_returns_to_previous_x() {
        let mut t = Triangle::default().with_velocity(0.5, 0.0);
        t.x = 0.99;
        move_triangle(&mut t);
        assert_eq!(departure(&t), Some(Side::Right));

        let back = reflect(t);
        assert_eq!(departure(&back), None);
    }

    #[test]
    fn test_floor_bounce() {
        let mut t = Triangle::default().with_velocity(0.0, -0.5);
        t.y = -0.99;
        move_triangle(&mut t);
        assert_eq!(t.y, -1.0);
        assert!(t.dy > 0.0);
    }

    #[test]
    fn test_ceiling_bounce() {
        let mut t = Triangle::default().with_velocity(0.0, 0.5);
        t.y = 0.8;
        move_triangle(&mut t);
        assert_eq!(t.y, 1.0 - TRIANGLE_CENTER_HEIGHT);
        assert!(t.dy < 0.0);
    }

    #[test]
    fn test_departure_is_strict() {
        let mut t = Triangle::default();
        t.x = 1.0;
        assert_eq!(departure(&t), None);
        t.x = -1.0;
        assert_eq!(departure(&t), None);
        t.x = -1.0001;
        assert_eq!(departure(&t), Some(Side::Left));
    }
}
