//! Reliable write transactions
//!
//! Writes are queued locally, then committed in one pass under the
//! operation lock: the peer echoes each prepared value back, every echo is
//! compared against what was sent, and only when all match is the
//! transaction executed. Anything else aborts the whole transaction on the
//! peer, so either every queued value lands or none does.

use super::correlator::{check_status, submitted};
use super::event::GattEvent;
use super::peripheral::Peripheral;
use super::tree::{CharacteristicProperties, RemoteCharacteristic};
use super::types::WriteType;
use super::{Capability, GattError, Result};

struct QueuedWrite {
    characteristic: RemoteCharacteristic,
    value: Vec<u8>,
}

/// A pending reliable write against one peripheral.
pub struct ReliableWrite<'a> {
    peripheral: &'a Peripheral,
    queue: Vec<QueuedWrite>,
}

impl<'a> ReliableWrite<'a> {
    pub(crate) fn new(peripheral: &'a Peripheral) -> Self {
        Self {
            peripheral,
            queue: Vec::new(),
        }
    }

    /// Queue a value. Fails at once if the characteristic is stale or
    /// cannot be written with a response.
    pub fn write(&mut self, characteristic: &RemoteCharacteristic, value: &[u8]) -> Result<&mut Self> {
        if !characteristic.is_valid() {
            return Err(GattError::InvalidAttribute(characteristic.id()));
        }
        if !characteristic
            .properties()
            .contains(CharacteristicProperties::WRITE)
        {
            return Err(GattError::MissingCapability(Capability::Write));
        }
        self.queue.push(QueuedWrite {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Run the transaction. An empty transaction commits trivially.
    pub async fn commit(self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let peripheral = self.peripheral;
        let _guard = peripheral.lock_operations("reliable write").await;
        peripheral.ensure_connected()?;
        for queued in &self.queue {
            if !queued.characteristic.is_valid() {
                return Err(GattError::InvalidAttribute(queued.characteristic.id()));
            }
        }

        submitted(
            "begin reliable write",
            peripheral.executor().begin_reliable_write(),
        )?;
        log::debug!("Reliable write started, {} queued values", self.queue.len());

        let mut abort = AbortOnDrop {
            peripheral,
            armed: true,
        };
        for queued in &self.queue {
            let target = queued.characteristic.id();
            let echoed = peripheral
                .submit_and_wait(
                    "reliable write",
                    || {
                        peripheral.executor().write_characteristic(
                            target,
                            &queued.value,
                            WriteType::WithResponse,
                        )
                    },
                    move |event| match event {
                        GattEvent::CharacteristicWrite {
                            target: t,
                            value,
                            status,
                        } if *t == target => Some(check_status("reliable write", *status, value.clone())),
                        _ => None,
                    },
                )
                .await?;
            if echoed != queued.value {
                log::warn!(
                    "Reliable write echo mismatch on {}: sent {}, got {}",
                    target,
                    hex::encode(&queued.value),
                    hex::encode(&echoed)
                );
                return Err(GattError::ValueMismatch {
                    attribute: target,
                    expected: queued.value.clone(),
                    actual: echoed,
                });
            }
        }

        peripheral
            .submit_and_wait(
                "execute reliable write",
                || peripheral.executor().execute_reliable_write(),
                |event| match event {
                    GattEvent::ReliableWriteCompleted { status } => {
                        Some(check_status("execute reliable write", *status, ()))
                    }
                    _ => None,
                },
            )
            .await?;
        abort.armed = false;
        log::debug!("Reliable write committed");
        Ok(())
    }
}

/// Aborts the transaction on the executor unless disarmed.
struct AbortOnDrop<'a> {
    peripheral: &'a Peripheral,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::info!("Aborting reliable write");
            self.peripheral.executor().abort_reliable_write();
        }
    }
}
