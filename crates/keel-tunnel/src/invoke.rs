//! Resolve-tunnel-relay operations exposed to the command layer

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterProvider};
use crate::endpoint::{AppEndpoint, PortSelection, TunnelOptions, TunnelSpec, DEFAULT_BIND_HOST};
use crate::relay::{
    invoke_path, invoke_url_at, Frame, RequestRelay, StreamEnd, StreamRelay, DEFAULT_API_VERSION,
};
use crate::session::TunnelSession;
use crate::signal::{CancelBroadcaster, CancelRegistration};
use crate::{InvokeError, TunnelError};

/// Environment variable present inside every cluster pod
const IN_CLUSTER_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// How `invoke` reaches the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    /// Direct when running inside the cluster and the pod IP is known,
    /// otherwise through the API server's pod proxy
    #[default]
    Auto,
    Proxy,
    Tunnel,
    Direct,
}

impl std::str::FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Route::Auto),
            "proxy" => Ok(Route::Proxy),
            "tunnel" => Ok(Route::Tunnel),
            "direct" => Ok(Route::Direct),
            _ => Err(format!(
                "Invalid route: {}. Use 'auto', 'proxy', 'tunnel' or 'direct'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Direct(SocketAddr),
    Proxy,
    Tunnel,
}

fn choose_target(
    route: Route,
    in_cluster: bool,
    endpoint: &AppEndpoint,
) -> Result<Target, TunnelError> {
    let direct = endpoint
        .pod_ip
        .map(|ip| SocketAddr::new(ip, endpoint.http_port));

    match (route, direct) {
        (Route::Tunnel, _) => Ok(Target::Tunnel),
        (Route::Proxy, _) => Ok(Target::Proxy),
        (Route::Direct, Some(addr)) => Ok(Target::Direct(addr)),
        (Route::Direct, None) => Err(TunnelError::resolution(
            &endpoint.app_id,
            format!("pod {} has no IP for a direct call", endpoint.pod_name),
        )),
        (Route::Auto, Some(addr)) if in_cluster => Ok(Target::Direct(addr)),
        (Route::Auto, _) => Ok(Target::Proxy),
    }
}

/// Settings shared by every operation of an [`Invoker`]
#[derive(Debug, Clone)]
pub struct InvokerSettings {
    pub api_version: String,
    pub bind_host: String,
    pub emit_logs: bool,
    pub route: Route,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            emit_logs: false,
            route: Route::Auto,
        }
    }
}

/// A session kept registered with the interrupt broadcaster while alive
pub struct ManagedTunnel {
    session: TunnelSession,
    _registration: CancelRegistration,
}

impl Deref for ManagedTunnel {
    type Target = TunnelSession;

    fn deref(&self) -> &TunnelSession {
        &self.session
    }
}

impl DerefMut for ManagedTunnel {
    fn deref_mut(&mut self) -> &mut TunnelSession {
        &mut self.session
    }
}

/// Resolves targets, opens tunnels and relays traffic through them
pub struct Invoker {
    provider: Arc<dyn ClusterProvider>,
    settings: InvokerSettings,
    requests: RequestRelay,
    streams: StreamRelay,
    broadcaster: CancelBroadcaster,
}

impl Invoker {
    pub fn new(
        provider: Arc<dyn ClusterProvider>,
        settings: InvokerSettings,
    ) -> Result<Self, InvokeError> {
        Ok(Self {
            provider,
            requests: RequestRelay::new(settings.api_version.clone())?,
            streams: StreamRelay::new(),
            settings,
            broadcaster: CancelBroadcaster::new(),
        })
    }

    /// Use a shared broadcaster, typically the one a `SignalGuard` fires
    pub fn with_broadcaster(mut self, broadcaster: CancelBroadcaster) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn broadcaster(&self) -> &CancelBroadcaster {
        &self.broadcaster
    }

    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Invoke `method` on an app along the configured [`Route`].
    ///
    /// Direct and tunnel calls return the response body whatever the status;
    /// proxied calls surface a non-success status as an error.
    pub async fn invoke(
        &self,
        identifier: &str,
        method: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, InvokeError> {
        let client = self.provider.client().await?;
        let endpoint = resolve_running(client.as_ref(), identifier).await?;

        let in_cluster = std::env::var_os(IN_CLUSTER_ENV).is_some();
        match choose_target(self.settings.route, in_cluster, &endpoint)? {
            Target::Direct(addr) => {
                let url = invoke_url_at(addr, &self.settings.api_version, &endpoint.app_id, method);
                Ok(self.requests.send_to(&url, payload, verb).await?)
            }
            Target::Proxy => {
                let path = invoke_path(&self.settings.api_version, &endpoint.app_id, method);
                Ok(client.proxy(&endpoint, &path, payload, verb).await?)
            }
            Target::Tunnel => {
                self.request_through_tunnel(client, &endpoint, method, payload, verb)
                    .await
            }
        }
    }

    /// Invoke `method` on an app, always through a tunnel to its HTTP port
    pub async fn invoke_via_tunnel(
        &self,
        identifier: &str,
        method: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, InvokeError> {
        let client = self.provider.client().await?;
        let endpoint = resolve_running(client.as_ref(), identifier).await?;
        self.request_through_tunnel(client, &endpoint, method, payload, verb)
            .await
    }

    /// Open a stream to an app's own port, send `payload`, then hand every
    /// inbound data frame to `on_frame` until the peer closes, an IO error
    /// occurs or `cancel` fires.
    pub async fn stream_via_tunnel<F>(
        &self,
        identifier: &str,
        method: &str,
        payload: &str,
        cancel: &CancellationToken,
        on_frame: F,
    ) -> Result<StreamEnd, InvokeError>
    where
        F: FnMut(Frame),
    {
        let client = self.provider.client().await?;
        let endpoint = resolve_running(client.as_ref(), identifier).await?;
        let tunnel = self.open(client, &endpoint, PortSelection::App).await?;

        let result = self
            .streams
            .relay(&tunnel, method, payload, cancel, on_frame)
            .await;
        tunnel.stop();

        Ok(result?)
    }

    /// Forward a local port to a named pod port until the tunnel is stopped
    pub async fn forward(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<ManagedTunnel, InvokeError> {
        let client = self.provider.client().await?;
        let spec = TunnelSpec::new(
            namespace,
            pod,
            &self.settings.bind_host,
            local_port,
            remote_port,
            self.settings.emit_logs,
        )?;
        Ok(self.start(client, spec).await?)
    }

    async fn request_through_tunnel(
        &self,
        client: Arc<dyn ClusterClient>,
        endpoint: &AppEndpoint,
        method: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, InvokeError> {
        let tunnel = self.open(client, endpoint, PortSelection::Http).await?;

        let result = self
            .requests
            .send(&tunnel, &endpoint.app_id, method, payload, verb)
            .await;
        tunnel.stop();

        Ok(result?)
    }

    async fn open(
        &self,
        client: Arc<dyn ClusterClient>,
        endpoint: &AppEndpoint,
        port: PortSelection,
    ) -> Result<ManagedTunnel, TunnelError> {
        let options = TunnelOptions {
            port,
            host: self.settings.bind_host.clone(),
            local_port: 0,
            emit_logs: self.settings.emit_logs,
        };
        let spec = TunnelSpec::for_endpoint(endpoint, &options)?;
        self.start(client, spec).await
    }

    async fn start(
        &self,
        client: Arc<dyn ClusterClient>,
        spec: TunnelSpec,
    ) -> Result<ManagedTunnel, TunnelError> {
        let session = TunnelSession::new(client, spec);
        // Register before init so an interrupt during init also stops it
        let registration = self.broadcaster.register_stop(session.stop_handle());
        let mut tunnel = ManagedTunnel {
            session,
            _registration: registration,
        };
        tunnel.init().await?;
        Ok(tunnel)
    }
}

async fn resolve_running(
    client: &dyn ClusterClient,
    identifier: &str,
) -> Result<AppEndpoint, TunnelError> {
    let endpoint = client.resolve_pod(identifier).await?;
    endpoint.ensure_running()?;
    tracing::debug!(
        "Resolved {} to {}/{}",
        identifier,
        endpoint.namespace,
        endpoint.pod_name
    );
    Ok(endpoint)
}
