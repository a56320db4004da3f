//! Cached GATT attribute tree
//!
//! Services, characteristics and descriptors discovered on the remote
//! device. Every node carries the discovery epoch it was created in and a
//! handle to the peripheral's current epoch; a node is only usable while
//! the two agree. Disconnection and services-changed bump the epoch, which
//! invalidates every node handed out before.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{CharacteristicDescription, DescriptorDescription, ServiceDescription};
use super::types::{AttributeId, CLIENT_CHARACTERISTIC_CONFIGURATION};

bitflags::bitflags! {
    /// Characteristic properties as declared by the remote device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// The validity handle shared by all nodes of one discovery.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    current: Arc<AtomicU64>,
    epoch: u64,
}

impl DiscoverySession {
    pub(crate) fn new(current: Arc<AtomicU64>, epoch: u64) -> Self {
        Self { current, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the owning peripheral still vouches for this discovery.
    pub fn is_valid(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }
}

#[derive(Debug, Clone)]
pub struct RemoteService {
    id: AttributeId,
    primary: bool,
    characteristics: Vec<RemoteCharacteristic>,
    session: DiscoverySession,
}

impl RemoteService {
    pub(crate) fn bind(description: &ServiceDescription, session: &DiscoverySession) -> Self {
        let id = AttributeId::new(description.uuid, description.instance_id);
        let characteristics = description
            .characteristics
            .iter()
            .map(|c| RemoteCharacteristic::bind(c, id, session))
            .collect();
        Self {
            id,
            primary: description.primary,
            characteristics,
            session: session.clone(),
        }
    }

    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.id.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn characteristics(&self) -> &[RemoteCharacteristic] {
        &self.characteristics
    }

    /// First characteristic with the given UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&RemoteCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid() == uuid)
    }

    pub fn is_valid(&self) -> bool {
        self.session.is_valid()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteCharacteristic {
    id: AttributeId,
    service: AttributeId,
    properties: CharacteristicProperties,
    descriptors: Vec<RemoteDescriptor>,
    session: DiscoverySession,
}

impl RemoteCharacteristic {
    fn bind(
        description: &CharacteristicDescription,
        service: AttributeId,
        session: &DiscoverySession,
    ) -> Self {
        let id = AttributeId::new(description.uuid, description.instance_id);
        let descriptors = description
            .descriptors
            .iter()
            .map(|d| RemoteDescriptor::bind(d, id, session))
            .collect();
        Self {
            id,
            service,
            properties: description.properties,
            descriptors,
            session: session.clone(),
        }
    }

    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.id.uuid
    }

    pub fn service_id(&self) -> AttributeId {
        self.service
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn descriptors(&self) -> &[RemoteDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&RemoteDescriptor> {
        self.descriptors.iter().find(|d| d.uuid() == uuid)
    }

    /// The client characteristic configuration descriptor, if present.
    pub fn cccd(&self) -> Option<&RemoteDescriptor> {
        self.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION)
    }

    pub fn is_valid(&self) -> bool {
        self.session.is_valid()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.session.epoch()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    id: AttributeId,
    characteristic: AttributeId,
    session: DiscoverySession,
}

impl RemoteDescriptor {
    fn bind(
        description: &DescriptorDescription,
        characteristic: AttributeId,
        session: &DiscoverySession,
    ) -> Self {
        Self {
            id: AttributeId::new(description.uuid, description.instance_id),
            characteristic,
            session: session.clone(),
        }
    }

    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.id.uuid
    }

    pub fn characteristic_id(&self) -> AttributeId {
        self.characteristic
    }

    pub fn is_valid(&self) -> bool {
        self.session.is_valid()
    }
}
