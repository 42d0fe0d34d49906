//! In-process cluster whose pods are local TCP listeners

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use keel_tunnel::{
    AppEndpoint, ClusterClient, ClusterProvider, PodPhase, PodStream, RelayError, RequestStage,
    TunnelError,
};
use parking_lot::RwLock;
use tokio::net::TcpStream;

/// Sidecar HTTP port every loopback app reports
pub const SIDECAR_PORT: u16 = 3500;

/// App port every loopback app reports
pub const APP_PORT: u16 = 6789;

/// Default namespace for registered apps
pub const NAMESPACE: &str = "keel-system";

#[derive(Default)]
struct Inner {
    apps: DashMap<String, AppEndpoint>,
    /// (namespace, pod, port) -> local listener
    ports: DashMap<(String, String, u16), SocketAddr>,
    dials: AtomicUsize,
    resolves: AtomicUsize,
    proxied: AtomicUsize,
    refuse_dials: AtomicBool,
    dial_delay: RwLock<Option<Duration>>,
    unavailable: RwLock<Option<String>>,
}

/// A fake cluster for driving the tunnel subsystem end to end
///
/// Acts as both the [`ClusterProvider`] and the [`ClusterClient`] it hands
/// out; clones share state.
#[derive(Clone, Default)]
pub struct LoopbackCluster {
    inner: Arc<Inner>,
}

impl LoopbackCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running app whose sidecar and app ports are served by
    /// the given local listeners
    pub fn add_app(&self, app_id: &str, sidecar: SocketAddr, app: Option<SocketAddr>) {
        let pod = format!("{}-0", app_id);
        self.inner.apps.insert(
            app_id.to_string(),
            AppEndpoint {
                app_id: app_id.to_string(),
                namespace: NAMESPACE.to_string(),
                pod_name: pod.clone(),
                http_port: SIDECAR_PORT,
                app_port: APP_PORT,
                phase: PodPhase::Running,
                pod_ip: None,
            },
        );

        self.expose(NAMESPACE, &pod, SIDECAR_PORT, sidecar);
        if let Some(app) = app {
            self.expose(NAMESPACE, &pod, APP_PORT, app);
        }
    }

    /// Map one pod port to a local listener
    pub fn expose(&self, namespace: &str, pod: &str, port: u16, addr: SocketAddr) {
        self.inner
            .ports
            .insert((namespace.to_string(), pod.to_string(), port), addr);
    }

    /// Change the reported phase of a registered app's pod
    pub fn set_phase(&self, app_id: &str, phase: PodPhase) {
        if let Some(mut endpoint) = self.inner.apps.get_mut(app_id) {
            endpoint.phase = phase;
        }
    }

    /// Make every `client()` call fail with `reason`
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *self.inner.unavailable.write() = Some(reason.into());
    }

    /// Reject every channel upgrade
    pub fn refuse_dials(&self, refuse: bool) {
        self.inner.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    /// Delay every channel upgrade
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.inner.dial_delay.write() = Some(delay);
    }

    /// Number of `open_port` calls so far
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Number of `resolve_pod` calls so far
    pub fn resolve_count(&self) -> usize {
        self.inner.resolves.load(Ordering::SeqCst)
    }

    /// Number of `proxy` calls so far
    pub fn proxy_count(&self) -> usize {
        self.inner.proxied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterProvider for LoopbackCluster {
    async fn client(&self) -> Result<Arc<dyn ClusterClient>, TunnelError> {
        if let Some(reason) = self.inner.unavailable.read().clone() {
            return Err(TunnelError::ClientUnavailable(reason));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ClusterClient for LoopbackCluster {
    async fn resolve_pod(&self, identifier: &str) -> Result<AppEndpoint, TunnelError> {
        self.inner.resolves.fetch_add(1, Ordering::SeqCst);
        self.inner
            .apps
            .get(identifier)
            .map(|e| e.value().clone())
            .ok_or_else(|| TunnelError::resolution(identifier, "no pods found"))
    }

    async fn open_port(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<PodStream, TunnelError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.dial_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.refuse_dials.load(Ordering::SeqCst) {
            return Err(TunnelError::establish(namespace, pod, port, "upgrade rejected"));
        }

        let addr = self
            .inner
            .ports
            .get(&(namespace.to_string(), pod.to_string(), port))
            .map(|a| *a.value())
            .ok_or_else(|| TunnelError::establish(namespace, pod, port, "port not exposed"))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::establish(namespace, pod, port, e))?;
        Ok(Box::new(stream))
    }

    /// Plays the API server: forwards to the exposed sidecar port and
    /// rejects non-success statuses
    async fn proxy(
        &self,
        endpoint: &AppEndpoint,
        path: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, RelayError> {
        self.inner.proxied.fetch_add(1, Ordering::SeqCst);

        let key = (
            endpoint.namespace.clone(),
            endpoint.pod_name.clone(),
            endpoint.http_port,
        );
        let addr = self.inner.ports.get(&key).map(|a| *a.value()).ok_or_else(|| {
            RelayError::request(RequestStage::Execution, "pod proxy: port not exposed")
        })?;

        let method = reqwest::Method::from_bytes(verb.as_bytes())
            .map_err(|e| RelayError::request(RequestStage::Construction, e))?;
        let mut request = reqwest::Client::new().request(method, format!("http://{}{}", addr, path));
        if !payload.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.to_vec());
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::request(RequestStage::Execution, e))?;
        response
            .text()
            .await
            .map_err(|e| RelayError::request(RequestStage::BodyRead, e))
    }
}
