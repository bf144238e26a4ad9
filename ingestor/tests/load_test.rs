use ingestor::{ConnectionHandler, Metrics, Server, ServerConfig, Storage, StorageConfig};
use rand::Rng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn random_payload(device_id: &str) -> String {
    let mut rng = rand::thread_rng();
    json!({
        "device_id": device_id,
        "device_type": "temperature_humidity_sensor",
        "location": "lab",
        "temperature": rng.gen_range(18.0..28.0),
        "humidity": rng.gen_range(40.0..80.0),
        "light_level": rng.gen_range(100..1000),
        "voltage": rng.gen_range(3.2..4.2),
    })
    .to_string()
}

async fn start(max_active: usize) -> (SocketAddr, Storage, CancellationToken, TempDir) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(&StorageConfig {
        database_path: dir.path().join("load.db"),
        max_connections: 8,
    })
    .await
    .unwrap();

    let metrics = Arc::new(Metrics::new().unwrap());
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_pending: 128,
        max_active,
        ..ServerConfig::default()
    };
    let handler = ConnectionHandler::new(
        storage.clone(),
        metrics.clone(),
        config.buffer_size,
        config.read_timeout(),
        config.write_timeout(),
    );
    let cancel = CancellationToken::new();
    let server = Server::bind(&config, handler, metrics, cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    (addr, storage, cancel, dir)
}

async fn send(addr: SocketAddr, payload: String) -> bool {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return false;
    };
    if stream.write_all(payload.as_bytes()).await.is_err() {
        return false;
    }
    let mut response = Vec::new();
    if stream.read_to_end(&mut response).await.is_err() {
        return false;
    }
    serde_json::from_slice::<Value>(&response)
        .map(|v| v["status"] == "success")
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_50_concurrent_clients() {
    let (addr, storage, cancel, _dir) = start(16).await;

    let clients: Vec<_> = (0..50)
        .map(|i| tokio::spawn(send(addr, random_payload(&format!("load-dev-{}", i)))))
        .collect();

    let mut ok = 0;
    for client in clients {
        if tokio::time::timeout(Duration::from_secs(30), client)
            .await
            .unwrap()
            .unwrap()
        {
            ok += 1;
        }
    }

    assert_eq!(ok, 50);
    assert_eq!(storage.reading_count().await.unwrap(), 50);
    assert_eq!(storage.device_statistics().await.unwrap().len(), 50);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_sustained_throughput() {
    println!("\nStarting sustained load test");

    let (addr, storage, cancel, _dir) = start(256).await;
    let total_messages = 5_000;
    let devices = 50;
    let burst_size = 100;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    for batch_start in (0..total_messages).step_by(burst_size) {
        let burst: Vec<_> = (batch_start..batch_start + burst_size)
            .map(|i| tokio::spawn(send(addr, random_payload(&format!("load-dev-{}", i % devices)))))
            .collect();
        for client in burst {
            if client.await.unwrap() {
                sent_count += 1;
            } else {
                error_count += 1;
            }
        }
    }

    let duration = start.elapsed();
    let rate = sent_count as f64 / duration.as_secs_f64();
    println!("  Total Sent:     {}", sent_count);
    println!("  Errors:         {}", error_count);
    println!("  Duration:       {:.2}s", duration.as_secs_f64());
    println!("  Actual Rate:    {:.2} req/s", rate);

    assert_eq!(error_count, 0, "Too many errors: {}", error_count);
    assert_eq!(storage.reading_count().await.unwrap(), total_messages as i64);

    let stats = storage.device_statistics().await.unwrap();
    assert_eq!(stats.len(), devices);
    assert!(stats
        .iter()
        .all(|s| s.record_count == (total_messages / devices) as i64));
    cancel.cancel();
}
