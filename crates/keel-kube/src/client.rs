use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use k8s_openapi::api::core::v1::Pod;
use keel_tunnel::{
    AppEndpoint, ClusterClient, ClusterProvider, PodIo, PodStream, RelayError, RequestStage,
    TunnelError,
};
use kube::api::{Api, ListParams, Portforwarder};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::resolve::{app_selector, endpoint_from_pod, select_pod, DEFAULT_SIDECAR_HTTP_PORT};

/// Options for building a cluster client
#[derive(Debug, Clone)]
pub struct KubeOptions {
    /// Kubeconfig context; `None` uses the current context or in-cluster config
    pub context: Option<String>,
    /// Restrict pod resolution to one namespace; `None` searches all
    pub namespace: Option<String>,
    pub sidecar_http_port: u16,
}

impl Default for KubeOptions {
    fn default() -> Self {
        Self {
            context: None,
            namespace: None,
            sidecar_http_port: DEFAULT_SIDECAR_HTTP_PORT,
        }
    }
}

/// Builds [`KubeCluster`] clients from ambient kubeconfig credentials
#[derive(Debug, Clone, Default)]
pub struct KubeProvider {
    options: KubeOptions,
}

impl KubeProvider {
    pub fn new(options: KubeOptions) -> Self {
        Self { options }
    }

    async fn config(&self) -> Result<Config, TunnelError> {
        match &self.options.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| TunnelError::ClientUnavailable(e.to_string()))
            }
            None => Config::infer()
                .await
                .map_err(|e| TunnelError::ClientUnavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl ClusterProvider for KubeProvider {
    async fn client(&self) -> Result<Arc<dyn ClusterClient>, TunnelError> {
        let config = self.config().await?;
        tracing::debug!("Using cluster API at {}", config.cluster_url);

        let client =
            Client::try_from(config).map_err(|e| TunnelError::ClientUnavailable(e.to_string()))?;

        Ok(Arc::new(KubeCluster {
            client,
            options: self.options.clone(),
        }))
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    options: KubeOptions,
}

impl KubeCluster {
    pub fn new(client: Client, options: KubeOptions) -> Self {
        Self { client, options }
    }

    fn pods(&self) -> Api<Pod> {
        match &self.options.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn resolve_pod(&self, identifier: &str) -> Result<AppEndpoint, TunnelError> {
        let params = ListParams::default().labels(&app_selector(identifier));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| TunnelError::resolution(identifier, e.to_string()))?;

        let pod = select_pod(pods.items)
            .ok_or_else(|| TunnelError::resolution(identifier, "no pods found"))?;

        endpoint_from_pod(identifier, &pod, self.options.sidecar_http_port)
    }

    async fn open_port(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<PodStream, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| TunnelError::establish(namespace, pod, port, e))?;

        let stream = forwarder.take_stream(port).ok_or_else(|| {
            TunnelError::establish(namespace, pod, port, "port missing from forwarder")
        })?;

        if let Some(error) = forwarder.take_error(port) {
            let target = format!("{}/{}:{}", namespace, pod, port);
            tokio::spawn(async move {
                if let Some(message) = error.await {
                    tracing::warn!("Port-forward error from {}: {}", target, message);
                }
            });
        }

        Ok(Box::new(PortForwardStream {
            stream: Box::new(stream),
            _forwarder: Box::new(forwarder),
        }))
    }

    async fn proxy(
        &self,
        endpoint: &AppEndpoint,
        path: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, RelayError> {
        let uri = proxy_path(endpoint, path);
        tracing::debug!("Proxying {} {}", verb, uri);

        let mut request = http::Request::builder().method(verb).uri(&uri);
        if !payload.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        let request = request
            .body(payload.to_vec())
            .map_err(|e| RelayError::request(RequestStage::Construction, e))?;

        self.client
            .request_text(request)
            .await
            .map_err(|e| RelayError::request(RequestStage::Execution, e))
    }
}

/// API server path proxying `path` to the endpoint's sidecar HTTP port
pub fn proxy_path(endpoint: &AppEndpoint, path: &str) -> String {
    format!(
        "/api/v1/namespaces/{}/pods/{}:{}/proxy/{}",
        endpoint.namespace,
        endpoint.pod_name,
        endpoint.http_port,
        path.trim_start_matches('/')
    )
}

/// Pod channel that keeps its forwarder alive for as long as it is used
struct PortForwardStream {
    stream: Box<dyn PodIo>,
    _forwarder: Box<Portforwarder>,
}

impl AsyncRead for PortForwardStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PortForwardStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
