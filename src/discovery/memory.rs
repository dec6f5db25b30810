//! In-process discovery
//!
//! Every screen sharing one `MemoryDiscovery` sees the others, which lets
//! several screens run inside one process (tests, local demos).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use super::{Discovery, DiscoveryEvent, DiscoveryResult, PeerAdvertisement, SCAN_CHANNEL_CAPACITY};

/// Shared in-memory advertisement registry
#[derive(Clone)]
pub struct MemoryDiscovery {
    adverts: Arc<RwLock<HashMap<Uuid, PeerAdvertisement>>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            adverts: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Currently advertised peers
    pub async fn advertised(&self) -> Vec<PeerAdvertisement> {
        self.adverts.read().await.values().cloned().collect()
    }

    pub async fn is_advertised(&self, instance_id: &Uuid) -> bool {
        self.adverts.read().await.contains_key(instance_id)
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn advertise(&self, advertisement: &PeerAdvertisement) -> DiscoveryResult<()> {
        // The write lock is held while broadcasting so scans never miss or
        // double-see an advertisement.
        let mut adverts = self.adverts.write().await;
        if adverts.get(&advertisement.instance_id) == Some(advertisement) {
            return Ok(());
        }
        adverts.insert(advertisement.instance_id, advertisement.clone());
        let _ = self.events.send(DiscoveryEvent::Found(advertisement.clone()));
        tracing::debug!("Advertising {} ({})", advertisement.name, advertisement.instance_id);
        Ok(())
    }

    async fn unadvertise(&self, advertisement: &PeerAdvertisement) -> DiscoveryResult<()> {
        let mut adverts = self.adverts.write().await;
        if adverts.remove(&advertisement.instance_id).is_some() {
            let _ = self.events.send(DiscoveryEvent::Lost(advertisement.instance_id));
            tracing::debug!("Stopped advertising {}", advertisement.name);
        }
        Ok(())
    }

    async fn scan(&self, interface: &str) -> DiscoveryResult<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let interface = interface.to_string();

        let (mut updates, snapshot) = {
            let adverts = self.adverts.read().await;
            let snapshot: Vec<_> = adverts
                .values()
                .filter(|a| a.interface == interface)
                .cloned()
                .collect();
            (self.events.subscribe(), snapshot)
        };

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            for advert in snapshot {
                seen.insert(advert.instance_id);
                if tx.send(DiscoveryEvent::Found(advert)).await.is_err() {
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    event = updates.recv() => event,
                    _ = tx.closed() => break,
                };
                let event = match event {
                    Ok(DiscoveryEvent::Found(advert)) if advert.interface == interface => {
                        seen.insert(advert.instance_id);
                        DiscoveryEvent::Found(advert)
                    }
                    Ok(DiscoveryEvent::Lost(id)) if seen.remove(&id) => DiscoveryEvent::Lost(id),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Scan fell behind, {} discovery events skipped", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            tracing::trace!("Memory scan for {} ended", interface);
        });

        Ok(rx)
    }
}
