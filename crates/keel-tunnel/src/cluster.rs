use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::AppEndpoint;
use crate::{RelayError, RequestStage, TunnelError};

/// A byte stream into a pod port
pub trait PodIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PodIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed channel returned by [`ClusterClient::open_port`]
pub type PodStream = Box<dyn PodIo>;

/// Builds cluster clients from ambient credentials.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Errors are reported as [`TunnelError::ClientUnavailable`].
    async fn client(&self) -> Result<Arc<dyn ClusterClient>, TunnelError>;
}

/// Operations the tunnel subsystem needs from the cluster.
///
/// A client may be shared read-only between sessions.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Map a human identifier to a concrete pod and its ports.
    async fn resolve_pod(&self, identifier: &str) -> Result<AppEndpoint, TunnelError>;

    /// Open one byte-stream channel to `port` inside the named pod.
    async fn open_port(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<PodStream, TunnelError>;

    /// Send one request to `path` on the endpoint's sidecar HTTP port via
    /// the API server's pod proxy, returning the body of a successful
    /// response. Clients without a proxy fail at execution.
    async fn proxy(
        &self,
        endpoint: &AppEndpoint,
        path: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, RelayError> {
        let _ = (path, payload, verb);
        Err(RelayError::request(
            RequestStage::Execution,
            format!("no pod proxy available for {}", endpoint.pod_name),
        ))
    }
}
