use ingestor::{DeviceId, Reading, Storage, StorageConfig};
use std::collections::HashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        database_path: dir.path().join("nested").join("sensor_data.db"),
        max_connections: 8,
    }
}

fn reading(device_id: &str) -> Reading {
    Reading::new(DeviceId::new(device_id).unwrap())
}

#[tokio::test]
async fn test_open_creates_parent_directory() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let storage = Storage::open(&config).await.unwrap();
    assert!(config.database_path.exists());
    assert_eq!(storage.reading_count().await.unwrap(), 0);
    storage.close().await;
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let storage = Storage::open(&config).await.unwrap();
    let first = storage.persist(&reading("dev-1")).await.unwrap();
    storage.persist(&reading("dev-1")).await.unwrap();
    storage.close().await;

    let storage = Storage::open(&config).await.unwrap();
    assert_eq!(storage.reading_count().await.unwrap(), 2);
    let device = storage.device("dev-1").await.unwrap().unwrap();
    assert_eq!(device.total_records, 2);
    assert_eq!(device.first_seen, first.received_at);

    let third = storage.persist(&reading("dev-1")).await.unwrap();
    let device = storage.device("dev-1").await.unwrap().unwrap();
    assert_eq!(device.total_records, 3);
    assert_eq!(device.first_seen, first.received_at);
    assert_eq!(device.last_seen, third.received_at);
    storage.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_persists_distinct_devices() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(&config(&dir)).await.unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.persist(&reading(&format!("dev-{}", i))).await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(storage.reading_count().await.unwrap(), 50);
    let stats = storage.device_statistics().await.unwrap();
    assert_eq!(stats.len(), 50);
    assert!(stats.iter().all(|s| s.record_count == 1));
    let devices: HashSet<_> = storage
        .devices()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.device_id)
        .collect();
    assert_eq!(devices.len(), 50);
    storage.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_persists_same_device_keep_rollup_consistent() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(&config(&dir)).await.unwrap();

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.persist(&reading("shared")).await })
        })
        .collect();

    let mut latest = None;
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        latest = latest.max(Some(receipt.received_at));
    }

    let device = storage.device("shared").await.unwrap().unwrap();
    assert_eq!(device.total_records, 40);
    assert_eq!(Some(device.last_seen), latest);

    let recent = storage.recent(Some("shared"), 100).await.unwrap();
    assert_eq!(recent.len(), 40);
    assert!(recent.iter().all(|r| r.received_at <= device.last_seen));
    storage.close().await;
}

#[tokio::test]
async fn test_failed_rollup_update_rolls_back_log_insert() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let storage = Storage::open(&config).await.unwrap();
    let first = storage.persist(&reading("dev-1")).await.unwrap();

    // A second connection makes every rollup update fail
    let admin = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&config.database_path))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_rollup_update BEFORE UPDATE ON devices \
         BEGIN SELECT RAISE(ABORT, 'rollup rejected'); END",
    )
    .execute(&admin)
    .await
    .unwrap();
    admin.close().await;

    let err = storage.persist(&reading("dev-1")).await.unwrap_err();
    assert!(err.to_string().contains("rollup rejected"));

    assert_eq!(storage.reading_count().await.unwrap(), 1);
    let recent = storage.recent(Some("dev-1"), 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, first.id);
    let device = storage.device("dev-1").await.unwrap().unwrap();
    assert_eq!(device.total_records, 1);
    assert_eq!(device.last_seen, first.received_at);

    // A device without a rollup row only needs the insert path
    storage.persist(&reading("dev-2")).await.unwrap();
    assert_eq!(storage.reading_count().await.unwrap(), 2);
    storage.close().await;
}
