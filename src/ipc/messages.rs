//! Control channel message types for client ↔ registry server communication.
//!
//! JSON Lines over a TCP stream. Every message carries the protocol version
//! `v` and a request `id` echoed by the reply; the payload is selected by a
//! `type` discriminator.

use serde::{Deserialize, Serialize};

use crate::domain::WorkItem;

/// Wire schema version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Protocol version of the sender.
    pub v: u32,
    /// Request ID for correlating the reply.
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

impl ControlRequest {
    pub fn new(id: u64, command: Command) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id,
            command,
        }
    }

    /// Create a `start` request asking for a work item.
    pub fn start(
        id: u64,
        job_id: impl Into<String>,
        log_path: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Command::Start {
                job_id: job_id.into(),
                log_path: log_path.into(),
                job_name: job_name.into(),
            },
        )
    }

    /// Create a `stop` request reporting `key` as finished.
    pub fn stop(id: u64, key: impl Into<String>) -> Self {
        Self::new(id, Command::Stop { key: key.into() })
    }
}

/// Command payload of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Claim the next work item.
    Start {
        job_id: String,
        log_path: String,
        job_name: String,
    },
    /// Report a work item as finished.
    Stop { key: String },
    /// Snapshot of the work items in claim order, one page at a time.
    ///
    /// Both fields are optional on the wire; a bare status request asks for everything.
    Status {
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl Command {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Status { .. } => "status",
        }
    }
}

/// Reply sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    /// Protocol version of the server.
    pub v: u32,
    /// Request ID this reply corresponds to.
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

impl ControlReply {
    pub fn new(id: u64, reply: Reply) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id,
            reply,
        }
    }
}

/// Reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// A work item was claimed for the caller.
    Assigned { key: String },
    /// Every item is claimed or done. Not an error.
    NoWork,
    /// Completion acknowledged. `known` is false for keys the registry never had.
    Ack { known: bool },
    /// One page of the registry in claim order. `total` counts every item.
    Status { items: Vec<WorkItem>, total: usize },
    /// The request failed on the server.
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
        }
    }

    /// Malformed or unparseable request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::InvalidRequest, message)
    }

    /// Request spoke a different protocol version.
    pub fn version_mismatch(client_version: u32) -> Self {
        Self::error(
            ErrorKind::VersionMismatch,
            format!(
                "Version mismatch: client={}, server={}",
                client_version, PROTOCOL_VERSION
            ),
        )
    }

    /// Server cannot take requests right now; the client may retry.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::Internal, message)
    }
}

/// Category of a server-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid JSON or an unknown request type.
    InvalidRequest,
    /// Client and server disagree on the protocol version.
    VersionMismatch,
    /// The server is shutting down or overloaded.
    Unavailable,
    /// Registry or persistence failure while handling the request.
    Internal,
}

impl ErrorKind {
    /// "Try again later" as opposed to fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
