use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const LOCATIONS: [&str; 5] = ["workshop_1", "workshop_2", "warehouse", "office", "lab"];
const DEVICE_TYPE: &str = "temperature_humidity_sensor";

/// Payload sent to the ingest server, one per connection
#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    pub device_id: String,
    pub device_type: String,
    pub location: String,
    pub temperature: f64,
    pub humidity: f64,
    pub light_level: i64,
    pub voltage: f64,
    pub timestamp: String,
}

/// Acknowledgement returned by the ingest server
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub status: String,
    pub message: String,
}

impl Ack {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// An emulated device with a fixed identity and location
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub location: String,
}

pub fn generate_devices(rng: &mut impl Rng, count: usize) -> Vec<Device> {
    (1..=count)
        .map(|i| Device {
            device_id: format!("SENSOR_{:03}", i),
            location: LOCATIONS
                .choose(rng)
                .copied()
                .unwrap_or("unknown")
                .to_string(),
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn generate_payload(rng: &mut impl Rng, device: &Device) -> SensorPayload {
    // Small fluctuation around a base value
    let temperature = round2(rng.gen_range(18.0..28.0) + rng.gen_range(-0.5..0.5));
    let humidity = round2(rng.gen_range(40.0..80.0) + rng.gen_range(-2.0..2.0));

    SensorPayload {
        device_id: device.device_id.clone(),
        device_type: DEVICE_TYPE.to_string(),
        location: device.location.clone(),
        temperature,
        humidity,
        light_level: rng.gen_range(100..=1000),
        voltage: round2(rng.gen_range(3.2..4.2)),
        timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    }
}
