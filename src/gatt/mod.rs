//! Client-side GATT link
//!
//! Connection lifecycle, serialized attribute operations correlated with
//! asynchronous platform events, and the cached remote attribute tree.

pub mod correlator;
pub mod discovery;
pub mod event;
pub mod executor;
pub mod notification;
pub mod op_lock;
pub mod peripheral;
pub mod reliable_write;
pub mod simulated;
pub mod tree;
pub mod types;

use std::fmt;

use thiserror::Error;

pub use event::GattEvent;
pub use executor::{ExecutorCapabilities, GattExecutor, TransportError};
pub use notification::{NotificationKind, Subscription};
pub use peripheral::Peripheral;
pub use reliable_write::ReliableWrite;
pub use tree::{CharacteristicProperties, RemoteCharacteristic, RemoteDescriptor, RemoteService};
pub use types::{AttributeId, ConnectionState, DisconnectionReason, GattStatus, WriteType};

/// A property or descriptor an operation needs but the attribute lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    WriteWithoutResponse,
    SignedWrite,
    Notify,
    Indicate,
    ClientCharacteristicConfiguration,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Read => "READ property",
            Capability::Write => "WRITE property",
            Capability::WriteWithoutResponse => "WRITE_WITHOUT_RESPONSE property",
            Capability::SignedWrite => "AUTHENTICATED_SIGNED_WRITES property",
            Capability::Notify => "NOTIFY or INDICATE property",
            Capability::Indicate => "INDICATE property",
            Capability::ClientCharacteristicConfiguration => {
                "client characteristic configuration descriptor"
            }
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GattError {
    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Attribute {0} is stale; rediscover services")]
    InvalidAttribute(types::AttributeId),

    #[error("{op} failed: {status}")]
    OperationFailed {
        op: &'static str,
        status: types::GattStatus,
    },

    #[error("Not permitted: missing {0}")]
    MissingCapability(Capability),

    #[error("Connection failed: {0}")]
    ConnectionFailed(types::DisconnectionReason),

    #[error("Reliable write echo mismatch on {attribute}: sent {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    ValueMismatch {
        attribute: types::AttributeId,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0} request not accepted by the transport")]
    RequestRejected(&'static str),

    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(types::GattStatus),
}

pub type Result<T, E = GattError> = std::result::Result<T, E>;
