//! Neighbor module - Links to the screens on either side
//!
//! A slot per side owns at most one link; each link runs a transfer stream
//! that forwards outgoing triangles and feeds incoming ones to the scene.

mod slot;
mod transfer;

pub use slot::*;
pub use transfer::*;
