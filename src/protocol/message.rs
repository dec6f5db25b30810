//! Protocol message definitions
//!
//! Defines the entity record and every message exchanged between neighbors.

use serde::{Deserialize, Serialize};

/// An RGB color with channels in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }
}

/// A moving entity, in the owning screen's normalized frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Triangle {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Triangle {
    /// A resting triangle at `(x, y)` painted with `color`
    pub fn new(x: f32, y: f32, color: Color) -> Self {
        Self {
            x,
            y,
            dx: 0.0,
            dy: 0.0,
            r: color.r,
            g: color.g,
            b: color.b,
        }
    }

    pub fn with_velocity(mut self, dx: f32, dy: f32) -> Self {
        self.dx = dx;
        self.dy = dy;
        self
    }

    pub fn color(&self) -> Color {
        Color::new(self.r, self.g, self.b)
    }
}

/// All possible protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask the remote screen to become our right neighbor (we become its left)
    Invite {
        protocol_version: u32,
        /// Human-readable name of the inviter
        name: String,
        /// Stable identifier of the inviter, used for color selection
        identity: Vec<u8>,
    },

    /// Answer to an Invite
    InviteAck {
        protocol_version: u32,
        accepted: bool,
        reason: Option<String>,
    },

    /// Hand a triangle over to the neighbor
    Give {
        triangle: Triangle,
    },

    /// Keeps an idle link observable
    Heartbeat {
        timestamp: u64,
    },

    /// Graceful disconnect
    Disconnect {
        reason: String,
    },
}

impl Message {
    /// Get the message type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Invite { .. } => 0x01,
            Message::InviteAck { .. } => 0x02,
            Message::Give { .. } => 0x10,
            Message::Heartbeat { .. } => 0xF0,
            Message::Disconnect { .. } => 0xFE,
        }
    }
}

/// Reason sent back to an inviter whose invitation hit an occupied left slot
pub const BUSY_REASON: &str = "already engaged with a previous invitation";
