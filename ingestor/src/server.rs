use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::errors::{Error, Result};
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Accepts ingest connections and runs one handler task per connection,
/// with at most `max_active` handlers alive at once.
pub struct Server {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    metrics: Arc<Metrics>,
    gate: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Server {
    /// Binds the listening socket with the configured backlog.
    pub async fn bind(
        config: &ServerConfig,
        handler: ConnectionHandler,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let addr = config.bind_addr();
        let bind_err = |source: std::io::Error| Error::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = lookup_host(&addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host did not resolve to any address",
                ))
            })?;

        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(resolved).map_err(bind_err)?;
        let listener = socket.listen(config.max_pending).map_err(bind_err)?;

        info!(
            "Data server listening on {} (backlog {}, max active {})",
            resolved, config.max_pending, config.max_active
        );

        Ok(Self {
            listener,
            handler: Arc::new(handler),
            metrics,
            gate: Arc::new(Semaphore::new(config.max_active)),
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop. Returns once the token is cancelled, the listening socket
    /// is closed, and every handler that was already dispatched has finished.
    pub async fn run(self) {
        let Server {
            listener,
            handler,
            metrics,
            gate,
            tracker,
            cancel,
        } = self;

        info!("Waiting for connections...");

        loop {
            // Admission: hold a permit before taking the next connection off the backlog
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            debug!("Accept interrupted by shutdown: {}", e);
                            break;
                        }
                        error!("Accept error: {}", e);
                        metrics.accept_errors_total.inc();
                        if is_resource_exhaustion(&e) {
                            sleep(Duration::from_millis(100)).await;
                        }
                        continue;
                    }
                },
            };

            metrics.connections_total.inc();
            metrics.active_connections.inc();

            let handler = handler.clone();
            let metrics = metrics.clone();
            tracker.spawn(async move {
                let _permit = permit;
                handler.handle(stream, peer).await;
                metrics.active_connections.dec();
            });
        }

        drop(listener);
        info!("Listener closed, waiting for {} in-flight connection(s)", tracker.len());

        tracker.close();
        tracker.wait().await;
        info!("Server shutdown complete");
    }
}

// Out of file descriptors or memory; back off instead of spinning on accept.
fn is_resource_exhaustion(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::OutOfMemory {
        return true;
    }
    let exhausted = e.raw_os_error().is_some_and(is_exhaustion_errno);
    if exhausted {
        warn!("Accept hit a resource limit: {}", e);
    }
    exhausted
}

#[cfg(unix)]
fn is_exhaustion_errno(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_exhaustion_errno(_code: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Storage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn server(max_active: usize) -> (Server, Storage) {
        let storage = Storage::in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
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
        let server = Server::bind(&config, handler, metrics, CancellationToken::new())
            .await
            .unwrap();
        (server, storage)
    }

    #[test]
    fn test_resource_exhaustion_detection() {
        assert!(is_resource_exhaustion(&std::io::Error::from(
            std::io::ErrorKind::OutOfMemory
        )));
        assert!(!is_resource_exhaustion(&std::io::Error::from(
            std::io::ErrorKind::ConnectionAborted
        )));
        #[cfg(unix)]
        {
            for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
                assert!(is_resource_exhaustion(&std::io::Error::from_raw_os_error(code)));
            }
            assert!(!is_resource_exhaustion(&std::io::Error::from_raw_os_error(
                libc::ECONNABORTED
            )));
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (first, _storage) = server(4).await;
        let port = first.local_addr().unwrap().port();

        let storage = Storage::in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..ServerConfig::default()
        };
        let handler = ConnectionHandler::new(
            storage,
            metrics.clone(),
            1024,
            config.read_timeout(),
            config.write_timeout(),
        );
        // SO_REUSEADDR does not allow two listeners on one port
        let result = Server::bind(&config, handler, metrics, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (server, _storage) = server(4).await;
        let addr = server.local_addr().unwrap();
        let cancel = server.shutdown_token();

        let handle = tokio::spawn(server.run());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_in_flight_handler_finishes_after_shutdown() {
        let (server, storage) = server(4).await;
        let addr = server.local_addr().unwrap();
        let cancel = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Give the loop time to accept before shutting down
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        client.write_all(br#"{"device_id":"late-dev"}"#).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["status"], "success");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(storage.reading_count().await.unwrap(), 1);
    }
}
