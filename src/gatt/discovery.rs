//! Discovery manager
//!
//! Owns the cached attribute tree and the once-per-epoch discovery flag.
//! The flag is raised the first time discovery is asked for and cleared
//! only by invalidation (disconnection or services-changed), so at most
//! one discovery is issued per epoch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::event::ServiceDescription;
use super::tree::{DiscoverySession, RemoteService};

/// Snapshot published to services observers. `None` while no valid tree exists.
pub type ServicesSnapshot = Option<Arc<Vec<RemoteService>>>;

pub struct DiscoveryManager {
    epoch: Arc<AtomicU64>,
    requested: AtomicBool,
    services_tx: watch::Sender<ServicesSnapshot>,
}

impl DiscoveryManager {
    pub fn new() -> Self {
        let (services_tx, _) = watch::channel(None);
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            requested: AtomicBool::new(false),
            services_tx,
        }
    }

    /// Observe the cached tree.
    pub fn observer(&self) -> watch::Receiver<ServicesSnapshot> {
        self.services_tx.subscribe()
    }

    /// Whether anybody is currently observing the tree.
    pub fn has_observers(&self) -> bool {
        self.services_tx.receiver_count() > 0
    }

    pub fn current(&self) -> ServicesSnapshot {
        self.services_tx.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Claim this epoch's discovery. Returns `true` for exactly one caller
    /// per epoch; that caller must issue the discovery request.
    pub fn begin(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    /// Give the claim back, e.g. when the request could not be submitted.
    pub fn release(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// The link came up: claim discovery if someone is watching the tree.
    pub fn on_connected(&self) -> bool {
        self.has_observers() && self.begin()
    }

    /// Replace the tree wholesale with freshly discovered services.
    pub fn on_discovered(&self, services: &[ServiceDescription]) -> Arc<Vec<RemoteService>> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session = DiscoverySession::new(Arc::clone(&self.epoch), epoch);
        let tree: Arc<Vec<RemoteService>> = Arc::new(
            services
                .iter()
                .map(|s| RemoteService::bind(s, &session))
                .collect(),
        );
        log::debug!(
            "Discovery epoch {}: {} services cached",
            epoch,
            tree.len()
        );
        self.services_tx.send_replace(Some(Arc::clone(&tree)));
        tree
    }

    /// Invalidate every node handed out so far and reset the discovery flag.
    pub fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested.store(false, Ordering::SeqCst);
        let had_tree = self.services_tx.send_replace(None).is_some();
        if had_tree {
            log::debug!("Attribute tree invalidated (epoch {})", epoch);
        }
    }
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::event::CharacteristicDescription;
    use crate::gatt::tree::CharacteristicProperties;
    use crate::gatt::types::uuid_from_u16;

    fn battery_service() -> Vec<ServiceDescription> {
        vec![ServiceDescription {
            uuid: uuid_from_u16(0x180f),
            instance_id: 1,
            primary: true,
            characteristics: vec![CharacteristicDescription {
                uuid: uuid_from_u16(0x2a19),
                instance_id: 2,
                properties: CharacteristicProperties::READ,
                descriptors: vec![],
            }],
        }]
    }

    #[test]
    fn test_begin_claims_once_per_epoch() {
        let manager = DiscoveryManager::new();
        assert!(manager.begin());
        assert!(!manager.begin());

        manager.invalidate();
        assert!(!manager.is_requested());
        assert!(manager.begin());
    }

    #[test]
    fn test_on_connected_requires_observer() {
        let manager = DiscoveryManager::new();
        assert!(!manager.on_connected());
        assert!(!manager.is_requested());

        let _observer = manager.observer();
        assert!(manager.on_connected());
        // Already claimed for this epoch.
        assert!(!manager.on_connected());
    }

    #[test]
    fn test_discovery_then_invalidation() {
        let manager = DiscoveryManager::new();
        let observer = manager.observer();
        assert!(observer.borrow().is_none());

        let tree = manager.on_discovered(&battery_service());
        let characteristic = tree[0].characteristics()[0].clone();
        assert!(characteristic.is_valid());
        assert_eq!(observer.borrow().as_ref().map(|t| t.len()), Some(1));

        manager.invalidate();
        assert!(!characteristic.is_valid());
        assert!(observer.borrow().is_none());
        assert!(manager.current().is_none());

        // A new discovery never revives nodes from an older one.
        let fresh = manager.on_discovered(&battery_service());
        assert!(fresh[0].characteristics()[0].is_valid());
        assert!(!characteristic.is_valid());
    }
}
