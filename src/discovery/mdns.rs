//! mDNS/DNS-SD discovery
//!
//! Screens register a DNS-SD service whose instance name is their instance
//! id; the remaining advertisement fields travel as TXT properties.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{
    Discovery, DiscoveryError, DiscoveryEvent, DiscoveryResult, PeerAdvertisement,
    SCAN_CHANNEL_CAPACITY,
};

const PROP_ID: &str = "id";
const PROP_NAME: &str = "name";
const PROP_INTERFACE: &str = "interface";

/// mDNS backed discovery
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    /// Full names of the services we registered
    registered: Mutex<HashSet<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> DiscoveryResult<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            registered: Mutex::new(HashSet::new()),
        })
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

/// DNS-SD service type for an interface tag, e.g. `_triangles._tcp.local.`
pub(crate) fn service_type(interface: &str) -> String {
    let label: String = interface
        .split('.')
        .next()
        .unwrap_or(interface)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(15)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("_{}._tcp.local.", label)
}

fn instance_name(instance_id: &Uuid) -> String {
    instance_id.simple().to_string()
}

fn full_name(instance_id: &Uuid, ty: &str) -> String {
    format!("{}.{}", instance_name(instance_id), ty)
}

/// Recover the instance id from a service full name
fn instance_id_from_fullname(fullname: &str, ty: &str) -> Option<Uuid> {
    let instance = fullname.strip_suffix(ty)?.strip_suffix('.')?;
    Uuid::parse_str(instance).ok()
}

fn advertisement_from_info(info: &ServiceInfo, interface: &str, ty: &str) -> Option<PeerAdvertisement> {
    if info.get_property_val_str(PROP_INTERFACE) != Some(interface) {
        return None;
    }
    let instance_id = info
        .get_property_val_str(PROP_ID)
        .and_then(|id| Uuid::parse_str(id).ok())
        .or_else(|| instance_id_from_fullname(info.get_fullname(), ty))?;

    let port = info.get_port();
    let mut addresses: Vec<SocketAddr> = info
        .get_addresses()
        .iter()
        .map(|ip| SocketAddr::new((*ip).into(), port))
        .collect();
    addresses.sort();

    let attributes: HashMap<String, String> = info
        .get_properties()
        .iter()
        .filter(|p| ![PROP_ID, PROP_NAME, PROP_INTERFACE].contains(&p.key()))
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    Some(PeerAdvertisement {
        instance_id,
        name: info
            .get_property_val_str(PROP_NAME)
            .unwrap_or_else(|| info.get_fullname())
            .to_string(),
        interface: interface.to_string(),
        attributes,
        addresses,
    })
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn advertise(&self, advertisement: &PeerAdvertisement) -> DiscoveryResult<()> {
        let ty = service_type(&advertisement.interface);
        let fullname = full_name(&advertisement.instance_id, &ty);

        let mut registered = self.registered.lock().await;
        if registered.contains(&fullname) {
            return Ok(());
        }

        let host_name = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "triangles".to_string())
        );
        let port = advertisement.addresses.first().map(|a| a.port()).ok_or_else(|| {
            DiscoveryError::Registration("advertisement has no address".to_string())
        })?;
        let ips: Vec<String> = advertisement
            .addresses
            .iter()
            .filter(|a| !a.ip().is_unspecified())
            .map(|a| a.ip().to_string())
            .collect();

        let mut properties = advertisement.attributes.clone();
        properties.insert(PROP_ID.to_string(), advertisement.instance_id.to_string());
        properties.insert(PROP_NAME.to_string(), advertisement.name.clone());
        properties.insert(PROP_INTERFACE.to_string(), advertisement.interface.clone());

        let mut info = ServiceInfo::new(
            &ty,
            &instance_name(&advertisement.instance_id),
            &host_name,
            ips.join(",").as_str(),
            port,
            properties,
        )
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
        if ips.is_empty() {
            // Bound to a wildcard address: let the daemon publish every interface.
            info = info.enable_addr_auto();
        }

        self.daemon.register(info)?;
        registered.insert(fullname);
        tracing::info!("Registered service {} on port {}", advertisement.name, port);
        Ok(())
    }

    async fn unadvertise(&self, advertisement: &PeerAdvertisement) -> DiscoveryResult<()> {
        let ty = service_type(&advertisement.interface);
        let fullname = full_name(&advertisement.instance_id, &ty);

        let mut registered = self.registered.lock().await;
        if !registered.remove(&fullname) {
            return Ok(());
        }

        let status = self.daemon.unregister(&fullname)?;
        let status = status.recv_async().await.map_err(|_| DiscoveryError::Stopped)?;
        tracing::info!("Unregistered service {}: {:?}", advertisement.name, status);
        Ok(())
    }

    async fn scan(&self, interface: &str) -> DiscoveryResult<mpsc::Receiver<DiscoveryEvent>> {
        let ty = service_type(interface);
        let browser: flume::Receiver<ServiceEvent> = self.daemon.browse(&ty)?;
        let daemon = self.daemon.clone();
        let interface = interface.to_string();
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = browser.recv_async() => event,
                    _ = tx.closed() => break,
                };
                let event = match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        match advertisement_from_info(&info, &interface, &ty) {
                            Some(advert) => DiscoveryEvent::Found(advert),
                            None => continue,
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        match instance_id_from_fullname(&fullname, &ty) {
                            Some(id) => DiscoveryEvent::Lost(id),
                            None => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => {
                        tracing::warn!("mDNS browse channel for {} closed", ty);
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            let _ = daemon.stop_browse(&ty);
            tracing::debug!("Stopped browsing {}", ty);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_from_interface() {
        assert_eq!(service_type("triangles.Screen"), "_triangles._tcp.local.");
        assert_eq!(service_type("A_Very.Long"), "_avery._tcp.local.");
        assert_eq!(
            service_type("abcdefghijklmnopqrstuvwxyz"),
            "_abcdefghijklmno._tcp.local."
        );
    }

    #[test]
    fn test_instance_id_from_fullname() {
        let id = Uuid::new_v4();
        let ty = service_type("triangles.Screen");
        let fullname = full_name(&id, &ty);
        assert_eq!(instance_id_from_fullname(&fullname, &ty), Some(id));
        assert_eq!(instance_id_from_fullname("garbage._other._tcp.local.", &ty), None);
    }
}
