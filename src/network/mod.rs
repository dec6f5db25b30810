//! Network module - Handles the TCP links between neighboring screens
//!
//! Provides:
//! - Framed connections that split into independent directions
//! - The invite listener (we become someone's right neighbor)
//! - The invite client and the search for a right neighbor

mod server;
mod client;
mod connection;

pub use server::*;
pub use client::*;
pub use connection::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use uuid::Uuid;

use crate::discovery::{platform_attributes, PeerAdvertisement};
use crate::protocol::SERVICE_INTERFACE;

/// Runtime settings for the network core
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the invite listener binds to
    pub bind_address: IpAddr,
    /// Port to listen on (0 picks a free one)
    pub port: u16,
    /// Bound on the invite handshake read by the listener, in milliseconds
    pub connect_timeout_ms: u64,
    /// Bound on one outgoing invitation, including the remote user's decision
    pub invite_timeout_ms: u64,
    /// Bound on one entity send over an established link
    pub give_timeout_ms: u64,
    /// Heartbeat interval on an idle link
    pub heartbeat_interval_ms: u64,
    /// Capacity of each outgoing entity queue
    pub queue_capacity: usize,
    /// Pause before rescanning when a scan ends
    pub search_retry_ms: u64,
    /// Whether to look for a right neighbor at all
    pub seek_neighbors: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            invite_timeout_ms: 30_000,
            give_timeout_ms: 100,
            heartbeat_interval_ms: 1000,
            queue_capacity: 64,
            search_retry_ms: 1000,
            seek_neighbors: true,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Bind to loopback only
    pub fn loopback(mut self) -> Self {
        self.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }

    pub fn give_timeout(&self) -> Duration {
        Duration::from_millis(self.give_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn search_retry(&self) -> Duration {
        Duration::from_millis(self.search_retry_ms)
    }
}

/// Per-process identity, handed to every component at construction
#[derive(Debug, Clone)]
pub struct PeerContext {
    /// Random id chosen at start-up; filters out our own advertisement
    pub instance_id: Uuid,
    /// Stable identifier used for color selection
    pub identity: Vec<u8>,
    /// Human-readable name
    pub name: String,
    /// Interface tag we advertise and scan for
    pub interface: String,
}

impl PeerContext {
    /// A context with a fresh instance id. Without an explicit identity the
    /// instance id doubles as one.
    pub fn new(name: impl Into<String>, identity: Option<Vec<u8>>) -> Self {
        let instance_id = Uuid::new_v4();
        Self {
            instance_id,
            identity: identity.unwrap_or_else(|| instance_id.as_bytes().to_vec()),
            name: name.into(),
            interface: SERVICE_INTERFACE.to_string(),
        }
    }

    /// Our color, as every peer will compute it
    pub fn color(&self) -> crate::protocol::Color {
        crate::color::select_color(&self.identity)
    }

    /// The advertisement announcing an invite listener on `addresses`
    pub fn advertisement(&self, addresses: Vec<SocketAddr>) -> PeerAdvertisement {
        PeerAdvertisement {
            instance_id: self.instance_id,
            name: self.name.clone(),
            interface: self.interface.clone(),
            attributes: platform_attributes(),
            addresses,
        }
    }
}
