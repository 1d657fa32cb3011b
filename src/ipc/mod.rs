//! IPC Layer - control channel between job clients and the registry server
//!
//! This module provides:
//! - Versioned request/reply message types
//! - Newline-delimited JSON codec
//! - TCP server with a pluggable request handler
//! - Client connection with bounded request timeouts

pub mod client;
pub mod codec;
pub mod messages;
pub mod server;

pub use client::{IpcClient, IpcClientConfig};
pub use codec::{Decoded, MalformedFrame, NdJsonCodec};
pub use messages::{Command, ControlReply, ControlRequest, ErrorKind, PROTOCOL_VERSION, Reply};
pub use server::{IpcServer, IpcServerConfig, RequestHandler};

use crate::error::{ClaimrError, Result};

/// Turn an endpoint string into a socket address string.
///
/// Accepts `tcp://host:port` (the form batch job scripts pass around) and bare
/// `host:port`. A `*` host means all interfaces.
pub fn parse_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    let addr = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(ClaimrError::Config(format!(
                "Unsupported endpoint scheme '{}' in {}",
                scheme, endpoint
            )));
        }
        None => endpoint,
    };

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(ClaimrError::Config(format!("Endpoint is missing a port: {}", endpoint)));
    };
    if port.parse::<u16>().is_err() {
        return Err(ClaimrError::Config(format!("Invalid port in endpoint: {}", endpoint)));
    }

    let host = match host {
        "*" => "0.0.0.0",
        "" => return Err(ClaimrError::Config(format!("Endpoint is missing a host: {}", endpoint))),
        other => other,
    };
    Ok(format!("{}:{}", host, port))
}
