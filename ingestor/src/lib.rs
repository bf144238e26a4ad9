//! Sensor reading ingest server.
//!
//! Devices open a TCP connection, send one JSON reading, receive one JSON
//! acknowledgement and are disconnected. Readings are appended to a SQLite
//! log and folded into a per-device rollup in the same transaction.

pub mod codec;
pub mod config;
pub mod connection;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod rollup;
pub mod server;

pub use codec::{decode, Acknowledgement, Status};
pub use config::{ApiConfig, Config, ServerConfig, StorageConfig};
pub use connection::{ConnectionHandler, Outcome};
pub use db::Storage;
pub use errors::{DecodeError, Error, Result, StorageError};
pub use metrics::Metrics;
pub use model::{DeviceId, DeviceRecord, DeviceStatistics, Reading, Receipt, StoredReading};
pub use server::Server;
