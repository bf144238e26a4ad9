mod telemetry;

use clap::Parser;
use std::time::Duration;
use telemetry::{generate_devices, generate_payload, Ack, SensorPayload};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Emulated sensor devices sending readings to the ingest server
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "INGEST_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "INGEST_PORT", default_value_t = 8080)]
    port: u16,

    /// Number of emulated devices
    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Pause between rounds, in milliseconds
    #[arg(long, env = "SEND_INTERVAL_MS", default_value_t = 10_000)]
    interval_ms: u64,

    /// Stop after this many rounds; runs until interrupted if unset
    #[arg(long, env = "ROUNDS")]
    rounds: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = format!("{}:{}", args.host, args.port);
    let interval = Duration::from_millis(args.interval_ms);

    let mut rng = rand::thread_rng();
    let devices = generate_devices(&mut rng, args.devices);

    info!("Starting sensor simulator");
    info!("Server: {}, Devices: {}, Interval: {:?}", addr, devices.len(), interval);
    for device in &devices {
        info!("  {} ({})", device.device_id, device.location);
    }

    let mut round = 0u64;
    let mut sent = 0u64;
    let mut failed = 0u64;

    loop {
        if args.rounds.is_some_and(|limit| round >= limit) {
            break;
        }
        round += 1;

        for device in &devices {
            let payload = generate_payload(&mut rng, device);

            match send_reading(&addr, &payload).await {
                Ok(ack) if ack.is_success() => {
                    sent += 1;
                    info!(
                        "{}: Temp: {}C, Humidity: {}%, Light: {}",
                        payload.device_id, payload.temperature, payload.humidity, payload.light_level
                    );
                }
                Ok(ack) => {
                    failed += 1;
                    warn!("{}: server rejected reading: {}", payload.device_id, ack.message);
                }
                Err(e) => {
                    failed += 1;
                    warn!("{}: send error: {}", payload.device_id, e);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Emulation stopped by user");
                break;
            }
        }
    }

    info!("Simulator finished: {} sent, {} failed", sent, failed);
}

/// One connection per reading: connect, write, read the acknowledgement.
async fn send_reading(addr: &str, payload: &SensorPayload) -> Result<Ack, SendError> {
    let body = serde_json::to_vec(payload)?;

    let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| SendError::Timeout)??;
    timeout(IO_TIMEOUT, stream.write_all(&body))
        .await
        .map_err(|_| SendError::Timeout)??;

    let mut response = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .map_err(|_| SendError::Timeout)??;

    Ok(serde_json::from_slice(&response)?)
}
