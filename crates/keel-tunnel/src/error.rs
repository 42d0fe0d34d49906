use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while resolving a target or managing a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Cluster config or credentials could not be turned into a client
    #[error("cluster client unavailable: {0}")]
    ClientUnavailable(String),

    /// Target pod not found or not runnable
    #[error("cannot resolve '{identifier}': {reason}")]
    Resolution { identifier: String, reason: String },

    /// Upgrade negotiation or dialing the pod port failed
    #[error("tunnel to {namespace}/{pod}:{port} failed: {message}")]
    Establish {
        namespace: String,
        pod: String,
        port: u16,
        message: String,
    },

    /// Local listener could not be bound
    #[error("failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tunnel spec: {0}")]
    InvalidSpec(String),

    #[error("tunnel session already started")]
    AlreadyStarted,

    #[error("tunnel stopped before it became ready")]
    Stopped,

    /// The forwarding task went away without reporting an outcome
    #[error("tunnel forwarding task exited unexpectedly")]
    ForwarderLost,
}

impl TunnelError {
    /// Create a resolution error
    pub fn resolution(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Create an establish error
    pub fn establish(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        port: u16,
        message: impl fmt::Display,
    ) -> Self {
        Self::Establish {
            namespace: namespace.into(),
            pod: pod.into(),
            port,
            message: message.to_string(),
        }
    }
}

/// Stage of a request relay that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Construction,
    Execution,
    BodyRead,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStage::Construction => "request construction",
            RequestStage::Execution => "request execution",
            RequestStage::BodyRead => "body read",
        };
        f.write_str(label)
    }
}

/// Errors raised by the request and stream relays
#[derive(Debug, Error)]
pub enum RelayError {
    /// The session has no assigned local port yet
    #[error("tunnel is not ready; call init() before relaying")]
    NotReady,

    #[error("{stage}: {source}")]
    Request {
        stage: RequestStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("stream connect to {url} failed: {source}")]
    StreamConnect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("stream io: {0}")]
    StreamIo(#[source] tungstenite::Error),

    /// Peer closed the stream; a close frame is reported as the terminal error
    #[error("stream closed by peer{}", describe_close(.code, .reason))]
    StreamClosed { code: Option<u16>, reason: String },
}

impl RelayError {
    pub fn request(
        stage: RequestStage,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Request {
            stage,
            source: source.into(),
        }
    }

    /// True when the stream ended because the peer closed it
    pub fn is_close(&self) -> bool {
        matches!(self, RelayError::StreamClosed { .. })
    }
}

fn describe_close(code: &Option<u16>, reason: &str) -> String {
    match (code, reason.is_empty()) {
        (Some(code), true) => format!(" (code {})", code),
        (Some(code), false) => format!(" (code {}: {})", code, reason),
        (None, _) => String::new(),
    }
}

/// Errors from the high-level invoke and stream operations
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}
