// gattlink - Client-side BLE GATT link

pub mod central;
pub mod config;
pub mod gatt;

pub use central::Central;
pub use config::{ConfigError, ConnectMode, ConnectOptions, PeripheralConfig};
pub use gatt::{GattError, GattEvent, GattExecutor, Peripheral};
