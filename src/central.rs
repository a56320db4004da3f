//! Central manager
//!
//! Creates peripherals and keeps a weak registry of them, so that a
//! shutdown or the radio turning off can force every live link closed
//! without keeping dropped peripherals alive.

use std::sync::{Arc, Mutex, Weak};

use crate::config::PeripheralConfig;
use crate::gatt::{GattExecutor, Peripheral};

pub struct Central {
    config: PeripheralConfig,
    peripherals: Mutex<Vec<Weak<Peripheral>>>,
}

impl Central {
    pub fn new(config: PeripheralConfig) -> Self {
        Self {
            config,
            peripherals: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// A new peripheral driven by `executor`, tracked by this manager.
    pub fn peripheral(&self, executor: Arc<dyn GattExecutor>) -> Arc<Peripheral> {
        let peripheral = Peripheral::new(executor, self.config.clone());
        let mut peripherals = self.peripherals.lock().unwrap_or_else(|e| e.into_inner());
        peripherals.retain(|p| p.strong_count() > 0);
        peripherals.push(Arc::downgrade(&peripheral));
        peripheral
    }

    /// Every tracked peripheral still alive.
    pub fn peripherals(&self) -> Vec<Arc<Peripheral>> {
        let mut peripherals = self.peripherals.lock().unwrap_or_else(|e| e.into_inner());
        peripherals.retain(|p| p.strong_count() > 0);
        peripherals.iter().filter_map(Weak::upgrade).collect()
    }

    /// Close every peripheral; observers see a disconnection first.
    pub fn shutdown(&self) {
        let live = self.peripherals();
        log::info!("Shutting down {} peripherals", live.len());
        for peripheral in live {
            peripheral.force_close();
        }
    }

    /// The radio went off: no link can survive, so close them all.
    pub fn radio_disabled(&self) {
        log::warn!("Bluetooth radio disabled, closing all peripherals");
        for peripheral in self.peripherals() {
            peripheral.force_close();
        }
    }
}

impl Default for Central {
    fn default() -> Self {
        Self::new(PeripheralConfig::default())
    }
}
