//! Event model
//!
//! The closed set of events the platform layer produces. Events are
//! broadcast to every interested waiter and never queued per waiter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tree::CharacteristicProperties;
use super::types::{
    AttributeId, ConnectionParameters, ConnectionState, DisconnectionReason, GattStatus, PhyPair,
};

/// Plain-data description of a discovered service, as delivered by the
/// platform. The peripheral turns these into [`super::tree::RemoteService`]
/// nodes bound to the current discovery session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub uuid: Uuid,
    pub instance_id: u16,
    #[serde(default = "primary_default")]
    pub primary: bool,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicDescription>,
}

fn primary_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicDescription {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub properties: CharacteristicProperties,
    #[serde(default)]
    pub descriptors: Vec<DescriptorDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDescription {
    pub uuid: Uuid,
    pub instance_id: u16,
}

/// An event reported by the platform transport.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged(ConnectionState),
    ServicesDiscovered {
        services: Vec<ServiceDescription>,
        status: GattStatus,
    },
    ServicesChanged,
    CharacteristicRead {
        target: AttributeId,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        target: AttributeId,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Notification or indication from the peer.
    CharacteristicChanged { target: AttributeId, value: Vec<u8> },
    DescriptorRead {
        target: AttributeId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        target: AttributeId,
        value: Vec<u8>,
        status: GattStatus,
    },
    ReliableWriteCompleted { status: GattStatus },
    RssiRead { rssi: i16, status: GattStatus },
    MtuChanged { mtu: u16, status: GattStatus },
    PhyRead { phy: PhyPair, status: GattStatus },
    PhyChanged { phy: PhyPair, status: GattStatus },
    ConnectionParametersChanged {
        parameters: ConnectionParameters,
        status: GattStatus,
    },
}

impl GattEvent {
    /// The disconnection reason if this event reports the link going down.
    pub fn disconnection(&self) -> Option<DisconnectionReason> {
        match self {
            GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(reason)) => {
                Some(*reason)
            }
            _ => None,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            GattEvent::ConnectionStateChanged(_) => "connection-state-changed",
            GattEvent::ServicesDiscovered { .. } => "services-discovered",
            GattEvent::ServicesChanged => "services-changed",
            GattEvent::CharacteristicRead { .. } => "characteristic-read",
            GattEvent::CharacteristicWrite { .. } => "characteristic-write",
            GattEvent::CharacteristicChanged { .. } => "characteristic-changed",
            GattEvent::DescriptorRead { .. } => "descriptor-read",
            GattEvent::DescriptorWrite { .. } => "descriptor-write",
            GattEvent::ReliableWriteCompleted { .. } => "reliable-write-completed",
            GattEvent::RssiRead { .. } => "rssi-read",
            GattEvent::MtuChanged { .. } => "mtu-changed",
            GattEvent::PhyRead { .. } => "phy-read",
            GattEvent::PhyChanged { .. } => "phy-changed",
            GattEvent::ConnectionParametersChanged { .. } => "connection-parameters-changed",
        }
    }
}
