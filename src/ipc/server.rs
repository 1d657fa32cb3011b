//! IPC Server - TCP listener for the control channel
//!
//! Provides:
//! - TCP listener bound to the configured endpoint
//! - One task per client connection, one in-flight request per connection
//! - Version checking and malformed-frame replies
//! - Cooperative shutdown

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{ClaimrError, Result};
use crate::ipc::codec::{DEFAULT_MAX_FRAME, NdJsonCodec};
use crate::ipc::messages::{ControlReply, ControlRequest, PROTOCOL_VERSION, Reply};
use crate::ipc::parse_endpoint;

/// How long shutdown waits for open connections to finish their reply
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for the IPC server
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Endpoint to bind, `tcp://host:port` or `host:port`
    pub endpoint: String,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Largest accepted request frame in bytes
    pub max_frame: usize,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5555".to_string(),
            max_clients: 64,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl IpcServerConfig {
    /// Create config with custom endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set max clients
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set the frame cap for both directions
    pub fn with_max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }
}

/// Handler trait for processing requests
pub trait RequestHandler: Send + Sync {
    /// Handle a request and return the reply payload
    fn handle(&self, request: ControlRequest) -> impl std::future::Future<Output = Reply> + Send;
}

/// IPC Server for the control channel
pub struct IpcServer {
    config: IpcServerConfig,
    listener: TcpListener,
    clients: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl IpcServer {
    /// Bind the listener. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(config: IpcServerConfig) -> Result<Self> {
        let addr = parse_endpoint(&config.endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ClaimrError::Ipc(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self {
            config,
            listener,
            clients: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get count of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Accept and serve clients until shutdown
    pub async fn run<H: RequestHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!("control channel listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            if self.clients.load(Ordering::SeqCst) >= self.config.max_clients {
                                warn!("rejecting {}: at capacity ({} clients)", peer, self.config.max_clients);
                                continue;
                            }
                            self.clients.fetch_add(1, Ordering::SeqCst);

                            let handler = Arc::clone(&handler);
                            let clients = Arc::clone(&self.clients);
                            let shutdown = self.shutdown.clone();
                            let max_frame = self.config.max_frame;

                            tokio::spawn(async move {
                                debug!("client connected peer={}", peer);
                                if let Err(e) = handle_client(stream, handler, shutdown, max_frame).await {
                                    debug!("client {} closed with error: {}", peer, e);
                                }
                                clients.fetch_sub(1, Ordering::SeqCst);
                                debug!("client disconnected peer={}", peer);
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        // let in-flight replies reach their clients
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while self.client_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("control channel stopped");
        Ok(())
    }
}

/// Serve a single client connection, one request at a time
async fn handle_client<H: RequestHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
    max_frame: usize,
) -> Result<()> {
    let mut framed = Framed::new(stream, NdJsonCodec::<ControlRequest>::with_max_length(max_frame));

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.cancelled() => break,
        };

        let reply = match frame {
            None => break,
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Err(malformed))) => {
                warn!("rejecting request: {}", malformed);
                ControlReply::new(0, Reply::invalid_request(malformed.to_string()))
            }
            Some(Ok(Ok(request))) if request.v != PROTOCOL_VERSION => {
                warn!("rejecting request id={}: protocol v{}", request.id, request.v);
                ControlReply::new(request.id, Reply::version_mismatch(request.v))
            }
            Some(Ok(Ok(request))) => {
                let id = request.id;
                ControlReply::new(id, handler.handle(request).await)
            }
        };

        let id = reply.id;
        if let Err(e) = framed.send(reply).await {
            // the encoder refuses oversized replies before writing anything
            if e.kind() != io::ErrorKind::InvalidData {
                return Err(e.into());
            }
            warn!("reply id={} not sent: {}", id, e);
            framed
                .send(ControlReply::new(id, Reply::internal(format!("reply not sent: {}", e))))
                .await?;
        }
    }

    Ok(())
}
