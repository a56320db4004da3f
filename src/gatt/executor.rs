//! Executor boundary
//!
//! The narrow contract consumed from the platform transport. Every call
//! only initiates work: it returns at once with whether the request was
//! accepted, and the outcome arrives later as a [`GattEvent`] on the
//! executor's event stream.

use thiserror::Error;
use tokio::sync::broadcast;

use super::event::GattEvent;
use super::types::{AttributeId, ConnectionPriority, PhyMask, PhyOption, WriteType};

/// Faults raised by the platform layer while submitting a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Missing platform permission: {0}")]
    PermissionDenied(String),

    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Platform capabilities that change how an executor reports results.
///
/// Some platforms have no native callback for PHY or connection-parameter
/// updates; executors for those synthesize the events after the request so
/// the core never needs to special-case them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorCapabilities {
    pub synthesize_link_events: bool,
}

impl Default for ExecutorCapabilities {
    fn default() -> Self {
        Self {
            synthesize_link_events: false,
        }
    }
}

/// Initiate-only operations against a single remote peripheral.
///
/// `Ok(true)` means the request was submitted, `Ok(false)` that the
/// platform refused to queue it. The core never calls two correlated
/// requests concurrently on one executor.
pub trait GattExecutor: Send + Sync {
    /// Subscribe to the event stream. Events sent before the call are not seen.
    fn events(&self) -> broadcast::Receiver<GattEvent>;

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities::default()
    }

    fn connect(&self, auto_connect: bool, preferred_phy: PhyMask) -> Result<bool, TransportError>;

    fn discover_services(&self) -> Result<bool, TransportError>;

    fn read_rssi(&self) -> Result<bool, TransportError>;

    fn read_phy(&self) -> Result<bool, TransportError>;

    fn request_phy(
        &self,
        tx: PhyMask,
        rx: PhyMask,
        option: PhyOption,
    ) -> Result<bool, TransportError>;

    fn request_mtu(&self, mtu: u16) -> Result<bool, TransportError>;

    fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<bool, TransportError>;

    fn read_characteristic(&self, target: AttributeId) -> Result<bool, TransportError>;

    fn write_characteristic(
        &self,
        target: AttributeId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<bool, TransportError>;

    fn read_descriptor(&self, target: AttributeId) -> Result<bool, TransportError>;

    fn write_descriptor(&self, target: AttributeId, value: &[u8]) -> Result<bool, TransportError>;

    fn begin_reliable_write(&self) -> Result<bool, TransportError>;

    fn execute_reliable_write(&self) -> Result<bool, TransportError>;

    fn abort_reliable_write(&self);

    /// Ask the platform to drop the link. A disconnection event follows.
    fn disconnect(&self);

    /// Release every transport resource held for this peripheral.
    fn close(&self);
}
