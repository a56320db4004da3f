use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures_util::StreamExt;

use gattlink::config::{ConnectOptions, PeripheralConfig};
use gattlink::gatt::event::{CharacteristicDescription, DescriptorDescription, ServiceDescription};
use gattlink::gatt::simulated::SimulatedDevice;
use gattlink::gatt::types::{uuid_from_u16, AttributeId, CLIENT_CHARACTERISTIC_CONFIGURATION};
use gattlink::gatt::CharacteristicProperties;
use gattlink::Central;

const HEART_RATE_SERVICE: u16 = 0x180d;
const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
const BODY_SENSOR_LOCATION: u16 = 0x2a38;

/// Connect to a simulated heart-rate monitor and stream its measurements.
#[derive(Parser)]
#[command(name = "gatt_sim")]
struct Cli {
    /// Extra direct connect attempts after a failure
    #[arg(long, default_value_t = 0)]
    retry: u32,

    /// Direct connect deadline (defaults to the config's connect timeout)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Auto-connect instead of a bounded direct attempt
    #[arg(long)]
    auto: bool,

    /// Measurements to receive before disconnecting
    #[arg(short = 'n', long, default_value_t = 5)]
    notifications: usize,

    /// JSON peripheral config
    #[arg(long)]
    config: Option<PathBuf>,
}

fn heart_rate_monitor() -> Vec<ServiceDescription> {
    vec![ServiceDescription {
        uuid: uuid_from_u16(HEART_RATE_SERVICE),
        instance_id: 1,
        primary: true,
        characteristics: vec![
            CharacteristicDescription {
                uuid: uuid_from_u16(HEART_RATE_MEASUREMENT),
                instance_id: 2,
                properties: CharacteristicProperties::NOTIFY,
                descriptors: vec![DescriptorDescription {
                    uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                    instance_id: 3,
                }],
            },
            CharacteristicDescription {
                uuid: uuid_from_u16(BODY_SENSOR_LOCATION),
                instance_id: 4,
                properties: CharacteristicProperties::READ,
                descriptors: vec![],
            },
        ],
    }]
}

fn sensor_location(code: u8) -> &'static str {
    match code {
        0 => "other",
        1 => "chest",
        2 => "wrist",
        3 => "finger",
        4 => "hand",
        5 => "ear lobe",
        6 => "foot",
        _ => "unknown",
    }
}

/// Beats per minute from a heart rate measurement value.
fn parse_bpm(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x01 == 0 {
        value.get(1).map(|bpm| u16::from(*bpm))
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PeripheralConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PeripheralConfig::default(),
    };
    let options = if cli.auto {
        ConnectOptions::auto()
    } else {
        let timeout = cli
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(config.connect_timeout);
        ConnectOptions::direct(timeout, cli.retry)
    };

    let device = Arc::new(SimulatedDevice::new(heart_rate_monitor()));
    device.set_latency(Duration::from_millis(20));
    device.set_value(AttributeId::new(uuid_from_u16(BODY_SENSOR_LOCATION), 4), &[1]);

    let central = Central::new(config);
    let peripheral = central.peripheral(device.clone());

    println!("Connecting ({:?})...", options.mode);
    peripheral.connect(options).await?;
    println!("Connected, MTU {}", peripheral.request_mtu(247).await?);

    let service = uuid_from_u16(HEART_RATE_SERVICE);
    let Some(location) = peripheral
        .find_characteristic(service, uuid_from_u16(BODY_SENSOR_LOCATION))
        .await?
    else {
        bail!("body sensor location characteristic not found");
    };
    let Some(measurement) = peripheral
        .find_characteristic(service, uuid_from_u16(HEART_RATE_MEASUREMENT))
        .await?
    else {
        bail!("heart rate measurement characteristic not found");
    };

    let code = peripheral.read(&location).await?;
    println!(
        "Sensor location: {}",
        sensor_location(code.first().copied().unwrap_or(0xff))
    );

    let mut measurements = peripheral.subscribe(&measurement).await?;
    let sensor = {
        let device = Arc::clone(&device);
        let target = measurement.id();
        let count = cli.notifications;
        tokio::spawn(async move {
            for beat in 0..count {
                tokio::time::sleep(Duration::from_millis(250)).await;
                device.notify(target, &[0x00, 62 + (beat % 20) as u8]);
            }
        })
    };

    let mut received = 0;
    while received < cli.notifications {
        let Some(value) = measurements.next().await else {
            bail!("link dropped after {} measurements", received);
        };
        match parse_bpm(&value) {
            Some(bpm) => println!("Heart rate: {} bpm", bpm),
            None => println!("Malformed measurement: {}", hex::encode(&value)),
        }
        received += 1;
    }
    sensor.await?;

    drop(measurements);
    peripheral.disconnect().await;
    println!("Disconnected: {}", peripheral.state());
    central.shutdown();
    Ok(())
}
