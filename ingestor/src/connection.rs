//! Per-connection ingest protocol: one receive, one decode, one persist,
//! one acknowledgement, then close.

use crate::codec::{decode, Acknowledgement};
use crate::db::Storage;
use crate::errors::{Error, Result};
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

pub const MSG_SAVED: &str = "Data received and saved successfully";
pub const MSG_INVALID: &str = "Invalid data format";
pub const MSG_DB_ERROR: &str = "Error saving to database";
pub const MSG_INTERNAL: &str = "Internal server error";

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Peer closed without sending anything.
    NoData,
    /// Nothing arrived before the read timeout.
    TimedOut,
    ReceiveFailed,
    Rejected,
    PersistFailed,
    Stored,
}

pub struct ConnectionHandler {
    storage: Storage,
    metrics: Arc<Metrics>,
    buffer_size: usize,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(
        storage: Storage,
        metrics: Arc<Metrics>,
        buffer_size: usize,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            metrics,
            buffer_size,
            read_timeout,
            write_timeout,
        }
    }

    /// Runs the whole exchange. The stream is dropped, and therefore closed,
    /// on every path out of this function.
    #[instrument(name = "connection", skip_all, fields(peer = %peer, conn_id = %uuid::Uuid::new_v4()))]
    pub async fn handle<S>(&self, mut stream: S, peer: SocketAddr) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("New connection");
        let outcome = self.exchange(&mut stream).await;

        let _ = stream.shutdown().await;
        debug!("Connection closed: {:?}", outcome);
        outcome
    }

    async fn exchange<S>(&self, stream: &mut S) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let n = match timeout(self.read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!("Peer sent no data");
                return Outcome::NoData;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("Receive failed: {}", e);
                return Outcome::ReceiveFailed;
            }
            Err(_) => {
                warn!("No data within {:?}, closing", self.read_timeout);
                self.metrics.receive_timeouts_total.inc();
                return Outcome::TimedOut;
            }
        };

        self.metrics.requests_total.inc();
        if n == buf.len() {
            debug!("Request filled the {} byte buffer and may be truncated", n);
        }

        let reading = match decode(&buf[..n]) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Rejected request: {}", e);
                self.metrics.invalid_requests_total.inc();
                self.respond(stream, Acknowledgement::error(MSG_INVALID)).await;
                return Outcome::Rejected;
            }
        };

        let start = Instant::now();
        match self.storage.persist(&reading).await {
            Ok(receipt) => {
                self.metrics
                    .persist_latency_seconds
                    .observe(start.elapsed().as_secs_f64());
                self.metrics.readings_stored_total.inc();
                info!("Data from {} saved as #{}", reading.device_id, receipt.id);

                let ack = Acknowledgement::success(MSG_SAVED)
                    .with_field("device_id", reading.device_id.as_str());
                self.respond(stream, ack).await;
                Outcome::Stored
            }
            Err(e) => {
                error!(
                    transient = e.is_transient(),
                    "Error saving data from {}: {}", reading.device_id, e
                );
                self.metrics.db_failures_total.inc();
                self.respond(stream, Acknowledgement::error(MSG_DB_ERROR)).await;
                Outcome::PersistFailed
            }
        }
    }

    /// Sends `ack`; if that fails, makes one attempt at a generic error reply
    /// and otherwise gives up quietly.
    async fn respond<S>(&self, stream: &mut S, ack: Acknowledgement)
    where
        S: AsyncWrite + Unpin,
    {
        if let Err(e) = self.send(stream, &ack).await {
            warn!("Failed to send acknowledgement: {}", e);
            self.metrics.send_failures_total.inc();

            if let Err(e) = self.send(stream, &Acknowledgement::error(MSG_INTERNAL)).await {
                debug!("Fallback response also failed: {}", e);
            }
        }
    }

    async fn send<S>(&self, stream: &mut S, ack: &Acknowledgement) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let bytes = ack.encode()?;
        timeout(self.write_timeout, async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;
        Ok(())
    }
}
