//! Client transports for the tool-server protocol. Both variants hand out
//! the same reliable request/response primitive ([`RpcChannel`]); the
//! channel is created lazily at most once and is immutable for the
//! transport's lifetime.

mod channel;
mod sse;
mod stdio;

pub use channel::{RpcChannel, RpcSession};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already initialized")]
    AlreadyInitialized,
    #[error("failed to spawn tool server process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport channel error: {message}")]
    Channel { message: String },
    #[error("transport produced invalid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport channel closed before the response arrived")]
    ChannelClosed,
    #[error("event stream request failed: {source}")]
    Http {
        #[source]
        source: reqwest::Error,
    },
    #[error("event stream ended before announcing a message endpoint")]
    MissingEndpoint,
}

/// A duplex connection to one tool server, either over a child process's
/// standard streams or over an HTTP event stream.
pub enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
}

impl Transport {
    /// Stdio transport for the server program at `path`; the launch command
    /// is derived from the file suffix.
    pub fn stdio(path: impl AsRef<Path>) -> Self {
        Transport::Stdio(StdioTransport::new(path))
    }

    /// Event-stream transport against `url` with a default HTTP client.
    pub fn sse(url: impl Into<String>) -> Self {
        Transport::Sse(SseTransport::new(url))
    }

    /// Event-stream transport with an injected HTTP client (custom
    /// middleware, authentication headers, timeouts).
    pub fn sse_with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Transport::Sse(SseTransport::with_client(url, client))
    }

    /// Returns the channel, creating it on first call and memoizing it.
    pub async fn acquire(&self) -> Result<Arc<RpcChannel>, TransportError> {
        match self {
            Transport::Stdio(transport) => transport.acquire().await,
            Transport::Sse(transport) => transport.acquire().await,
        }
    }

    /// Eagerly creates the channel; fails if one already exists. Callers
    /// pick either this or [`Transport::acquire`] and do not mix them.
    pub async fn initialize(&self) -> Result<Arc<RpcChannel>, TransportError> {
        match self {
            Transport::Stdio(transport) => transport.initialize().await,
            Transport::Sse(transport) => transport.initialize().await,
        }
    }

    /// Releases all owned resources: the channel, and the child process or
    /// HTTP client behind it.
    pub async fn close(&self) -> Result<(), TransportError> {
        match self {
            Transport::Stdio(transport) => transport.close().await,
            Transport::Sse(transport) => transport.close().await,
        }
    }
}
