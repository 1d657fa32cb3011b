//! IPC client for jobs to talk to the registry server.
//!
//! One connection, one in-flight request. Every exchange is bounded by the
//! configured timeout. After a timeout or transport error the connection is
//! dropped and re-opened on the next request, so a late reply to an abandoned
//! request can never be mistaken for the answer to a new one.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{ClaimrError, Result};
use crate::ipc::codec::NdJsonCodec;
use crate::ipc::messages::{Command, ControlReply, ControlRequest, Reply};
use crate::ipc::parse_endpoint;

/// Configuration for IPC client.
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    /// Server endpoint, `tcp://host:port` or `host:port`.
    pub endpoint: String,
    /// Bound on connect + send + receive for one request.
    pub timeout: Duration,
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5555".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl IpcClientConfig {
    /// Create config for a specific endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

type Connection = Framed<TcpStream, NdJsonCodec<ControlReply>>;

/// Client side of the control channel.
pub struct IpcClient {
    config: IpcClientConfig,
    conn: Option<Connection>,
    next_id: u64,
}

impl IpcClient {
    pub fn new(config: IpcClientConfig) -> Self {
        Self {
            config,
            conn: None,
            next_id: 1,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let addr = parse_endpoint(&self.config.endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClaimrError::Ipc(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        self.conn = Some(Framed::new(stream, NdJsonCodec::new()));
        debug!("connected to {}", addr);
        Ok(())
    }

    /// Close the connection. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            debug!("disconnected from {}", self.config.endpoint);
        }
    }

    /// Send a command and wait for its reply.
    pub async fn request(&mut self, command: Command) -> Result<Reply> {
        let id = self.next_id;
        self.next_id += 1;
        let request = ControlRequest::new(id, command);
        let timeout = self.config.timeout;

        let outcome = tokio::time::timeout(timeout, self.exchange(request)).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                Err(ClaimrError::Timeout(timeout))
            }
        }
    }

    async fn exchange(&mut self, request: ControlRequest) -> Result<Reply> {
        self.open_if_needed().await?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ClaimrError::Ipc("Not connected".into()))?;

        let id = request.id;
        debug!("sending {} id={}", request.command.name(), id);
        conn.send(request)
            .await
            .map_err(|e| ClaimrError::Ipc(format!("Failed to send request: {}", e)))?;

        let reply = match conn.next().await {
            None => return Err(ClaimrError::Ipc("Connection closed by server".into())),
            Some(Err(e)) => return Err(ClaimrError::Ipc(format!("Failed to read reply: {}", e))),
            Some(Ok(Err(malformed))) => return Err(ClaimrError::Ipc(format!("Bad reply: {}", malformed))),
            Some(Ok(Ok(reply))) => reply,
        };

        if reply.id != id {
            return Err(ClaimrError::Ipc(format!(
                "Reply id {} does not match request id {}",
                reply.id, id
            )));
        }
        Ok(reply.reply)
    }

    async fn open_if_needed(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.open().await?;
        }
        Ok(())
    }
}
