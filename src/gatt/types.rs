//! Core GATT value types
//!
//! Connection state, disconnection reasons, per-request status codes and
//! the small link-level value types (PHY, MTU, connection parameters)
//! shared by the executor boundary, the event model and the peripheral.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth SIG base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit short form if `uuid` sits on the Bluetooth base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_FFFFu128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID && (value >> 112) == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Client Characteristic Configuration Descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

/// Default ATT MTU before any exchange.
pub const DEFAULT_MTU: u16 = 23;

/// Largest MTU a peripheral may negotiate.
pub const MAX_MTU: u16 = 517;

/// Platform status the stack reports for almost any failure, including
/// connection attempts to addresses it cannot reach.
pub const PLATFORM_GATT_ERROR: i32 = 133;

/// Identity of a remote attribute: its UUID plus the instance id that
/// disambiguates several attributes sharing one UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId {
    pub uuid: Uuid,
    pub instance_id: u16,
}

impl AttributeId {
    pub fn new(uuid: Uuid, instance_id: u16) -> Self {
        Self { uuid, instance_id }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match short_uuid(&self.uuid) {
            Some(short) => write!(f, "{:04x}#{}", short, self.instance_id),
            None => write!(f, "{}#{}", self.uuid, self.instance_id),
        }
    }
}

/// Lifecycle of a single peripheral link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected(DisconnectionReason),
    /// Terminal until the next `connect`.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// `Disconnected` or `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a link ended (or never came up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectionReason {
    Success,
    LocalTerminate,
    PeerTerminate,
    LinkLoss,
    InsufficientAuthentication,
    Cancelled,
    UnsupportedAddress,
    UnsupportedConfiguration,
    /// The connect attempt ran past its deadline.
    Timeout(Duration),
    Unknown(i32),
}

impl DisconnectionReason {
    /// Map a platform/HCI disconnection status code.
    pub fn from_platform_code(code: i32) -> Self {
        match code {
            0x00 => DisconnectionReason::Success,
            0x05 => DisconnectionReason::InsufficientAuthentication,
            0x08 => DisconnectionReason::LinkLoss,
            0x13 => DisconnectionReason::PeerTerminate,
            0x16 => DisconnectionReason::LocalTerminate,
            0x1A => DisconnectionReason::UnsupportedConfiguration,
            0x0100 => DisconnectionReason::Cancelled,
            other => DisconnectionReason::Unknown(other),
        }
    }

    /// Whether a direct connect attempt ending with this reason may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DisconnectionReason::Cancelled
                | DisconnectionReason::UnsupportedAddress
                | DisconnectionReason::UnsupportedConfiguration
        )
    }
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectionReason::Success => write!(f, "success"),
            DisconnectionReason::LocalTerminate => write!(f, "terminated locally"),
            DisconnectionReason::PeerTerminate => write!(f, "terminated by peer"),
            DisconnectionReason::LinkLoss => write!(f, "link loss"),
            DisconnectionReason::InsufficientAuthentication => {
                write!(f, "insufficient authentication")
            }
            DisconnectionReason::Cancelled => write!(f, "cancelled"),
            DisconnectionReason::UnsupportedAddress => write!(f, "unsupported address"),
            DisconnectionReason::UnsupportedConfiguration => {
                write!(f, "unsupported configuration")
            }
            DisconnectionReason::Timeout(after) => write!(f, "timed out after {:?}", after),
            DisconnectionReason::Unknown(code) => write!(f, "unknown reason {:#x}", code),
        }
    }
}

/// Outcome of a single attribute-level request as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    ConnectionCongested,
    Failure,
    Unknown(i32),
}

impl GattStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0x00 => GattStatus::Success,
            0x01 => GattStatus::InvalidHandle,
            0x02 => GattStatus::ReadNotPermitted,
            0x03 => GattStatus::WriteNotPermitted,
            0x04 => GattStatus::InvalidPdu,
            0x05 => GattStatus::InsufficientAuthentication,
            0x06 => GattStatus::RequestNotSupported,
            0x07 => GattStatus::InvalidOffset,
            0x08 => GattStatus::InsufficientAuthorization,
            0x09 => GattStatus::PrepareQueueFull,
            0x0A => GattStatus::AttributeNotFound,
            0x0B => GattStatus::AttributeNotLong,
            0x0C => GattStatus::InsufficientEncryptionKeySize,
            0x0D => GattStatus::InvalidAttributeValueLength,
            0x0E => GattStatus::UnlikelyError,
            0x0F => GattStatus::InsufficientEncryption,
            0x10 => GattStatus::UnsupportedGroupType,
            0x11 => GattStatus::InsufficientResources,
            0x8F => GattStatus::ConnectionCongested,
            0x101 => GattStatus::Failure,
            other => GattStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::InvalidHandle => 0x01,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::InvalidPdu => 0x04,
            GattStatus::InsufficientAuthentication => 0x05,
            GattStatus::RequestNotSupported => 0x06,
            GattStatus::InvalidOffset => 0x07,
            GattStatus::InsufficientAuthorization => 0x08,
            GattStatus::PrepareQueueFull => 0x09,
            GattStatus::AttributeNotFound => 0x0A,
            GattStatus::AttributeNotLong => 0x0B,
            GattStatus::InsufficientEncryptionKeySize => 0x0C,
            GattStatus::InvalidAttributeValueLength => 0x0D,
            GattStatus::UnlikelyError => 0x0E,
            GattStatus::InsufficientEncryption => 0x0F,
            GattStatus::UnsupportedGroupType => 0x10,
            GattStatus::InsufficientResources => 0x11,
            GattStatus::ConnectionCongested => 0x8F,
            GattStatus::Failure => 0x101,
            GattStatus::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Unknown(code) => write!(f, "unknown status {:#x}", code),
            other => write!(f, "{:?} ({:#x})", other, other.code()),
        }
    }
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

/// A physical radio mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Transmit/receive PHY in use on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyPair {
    pub tx: Phy,
    pub rx: Phy,
}

impl Default for PhyPair {
    fn default() -> Self {
        Self {
            tx: Phy::Le1M,
            rx: Phy::Le1M,
        }
    }
}

bitflags::bitflags! {
    /// Set of PHYs a caller is willing to use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PhyMask: u8 {
        const LE_1M = 0x01;
        const LE_2M = 0x02;
        const LE_CODED = 0x04;
    }
}

impl Default for PhyMask {
    fn default() -> Self {
        PhyMask::LE_1M
    }
}

/// Coding preference when requesting the coded PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhyOption {
    NoPreference,
    S2,
    S8,
}

/// Coarse connection-interval preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnectionParameters {
    /// Typical parameters a central settles on for each priority.
    pub fn for_priority(priority: ConnectionPriority) -> Self {
        match priority {
            ConnectionPriority::High => Self {
                interval: 12,
                latency: 0,
                supervision_timeout: 500,
            },
            ConnectionPriority::Balanced => Self {
                interval: 36,
                latency: 0,
                supervision_timeout: 500,
            },
            ConnectionPriority::LowPower => Self {
                interval: 80,
                latency: 2,
                supervision_timeout: 500,
            },
        }
    }
}

/// Transient per-link attributes, reset whenever the link is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttributes {
    pub mtu: u16,
    pub phy: PhyPair,
    pub connection_parameters: Option<ConnectionParameters>,
}

impl Default for LinkAttributes {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            phy: PhyPair::default(),
            connection_parameters: None,
        }
    }
}
