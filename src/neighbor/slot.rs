//! Neighbor slot
//!
//! One of the two neighbor positions of a screen. While active it owns the
//! link's transfer stream and the producer end of its queue is with the
//! scene.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::transfer::{LinkSource, OutboundReport, TransferConfig, TransferError, TransferStream};
use crate::scene::{NeighborQueue, SceneSender, Side};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    #[error("{0} neighbor already active")]
    AlreadyActive(Side),
}

struct ActiveLink {
    peer: String,
    stream: TransferStream,
    /// Taken once the loss has been reported
    lost: Option<mpsc::Receiver<TransferError>>,
}

pub struct NeighborSlot {
    config: TransferConfig,
    queue_capacity: usize,
    scene: SceneSender,
    /// Tells the scene which queue (if any) now feeds this side. Never
    /// awaited: an update the scene has no room for is dropped.
    notify: mpsc::Sender<Option<NeighborQueue>>,
    active: Option<ActiveLink>,
}

impl NeighborSlot {
    pub fn new(
        config: TransferConfig,
        queue_capacity: usize,
        scene: SceneSender,
        notify: mpsc::Sender<Option<NeighborQueue>>,
    ) -> Self {
        Self {
            config,
            queue_capacity: queue_capacity.max(1),
            scene,
            notify,
            active: None,
        }
    }

    pub fn side(&self) -> Side {
        self.config.side
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Name of the peer on this side, if any
    pub fn peer(&self) -> Option<&str> {
        self.active.as_ref().map(|link| link.peer.as_str())
    }

    /// Start a link to `peer` and give the scene its queue
    pub fn activate<S>(&mut self, peer: impl Into<String>, source: LinkSource<S>) -> Result<(), SlotError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.active.is_some() {
            return Err(SlotError::AlreadyActive(self.side()));
        }

        let peer = peer.into();
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (lost_tx, lost_rx) = mpsc::channel(2);
        let stream = TransferStream::spawn(source, queue_rx, self.scene.clone(), self.config, lost_tx);
        self.active = Some(ActiveLink {
            peer: peer.clone(),
            stream,
            lost: Some(lost_rx),
        });

        self.publish(Some(queue_tx));
        tracing::info!("{} neighbor is now {}", self.side(), peer);
        Ok(())
    }

    /// Take the queue away from the scene and tear the link down. Queued
    /// triangles are reflected. Does nothing when inactive.
    pub async fn deactivate(&mut self) -> Option<OutboundReport> {
        let link = self.active.take()?;

        self.publish(None);
        let report = link.stream.close().await;
        tracing::info!("{} neighbor {} released", self.side(), link.peer);
        Some(report)
    }

    fn publish(&self, queue: Option<NeighborQueue>) {
        match self.notify.try_send(queue) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Scene is not reading {} neighbor updates, dropping one", self.side());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Scene gone, {} neighbor update dropped", self.side());
            }
        }
    }

    /// Resolves once, when the active link dies on its own. Pending while
    /// inactive, after the loss was reported, or after an explicit teardown.
    pub async fn lost(&mut self) -> TransferError {
        let Some(rx) = self.active.as_mut().and_then(|link| link.lost.as_mut()) else {
            return std::future::pending().await;
        };
        let error = rx.recv().await;
        if let Some(link) = self.active.as_mut() {
            link.lost = None;
        }
        match error {
            Some(error) => error,
            None => std::future::pending().await,
        }
    }
}
