//! Triangles - screens chained left to right that pass moving triangles
//! between each other
//!
//! Each screen advertises itself, invites a right neighbor and accepts at
//! most one left neighbor. A triangle leaving a screen past its edge is sent
//! to the neighbor on that side, or bounces back when there is none.

pub mod color;
pub mod config;
pub mod discovery;
pub mod manager;
pub mod neighbor;
pub mod network;
pub mod protocol;
pub mod scene;

pub use manager::{Invitation, InvitationResponse, NetworkChannels, NetworkError, NetworkManager, NeighborStatus};
