//! Color selection
//!
//! Every screen derives its color from a stable identifier, so the screen
//! itself and every peer it invites agree on it without a round trip.

use crate::protocol::Color;

/// Lowest channel value, keeps colors away from black
const CHANNEL_MIN: f32 = 30.0;
/// Highest channel value, keeps colors away from white
const CHANNEL_MAX: f32 = 225.0;

/// Pick a pastel color for the peer identified by `identity`.
///
/// Three distinct bytes of the blake3 digest are scaled into
/// `[30/255, 225/255]`.
pub fn select_color(identity: &[u8]) -> Color {
    let digest = blake3::hash(identity);
    let bytes = digest.as_bytes();
    let pick = |idx: usize| {
        (CHANNEL_MIN + (f32::from(bytes[idx]) / 255.0) * (CHANNEL_MAX - CHANNEL_MIN)) / 255.0
    };
    Color::new(pick(0), pick(7), pick(15))
}
