use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::TunnelError;

/// Default local bind host for tunnels
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Lifecycle phase reported for a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the cluster
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A resolved application pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEndpoint {
    pub app_id: String,
    pub namespace: String,
    pub pod_name: String,
    /// Port of the pod's HTTP invoke surface
    pub http_port: u16,
    /// Port the application itself listens on
    pub app_port: u16,
    pub phase: PodPhase,
    pub pod_ip: Option<IpAddr>,
}

impl AppEndpoint {
    /// Fail unless the pod is running
    pub fn ensure_running(&self) -> Result<(), TunnelError> {
        if self.phase == PodPhase::Running {
            Ok(())
        } else {
            Err(TunnelError::resolution(
                &self.app_id,
                format!("no running pods found (pod {} is {})", self.pod_name, self.phase),
            ))
        }
    }

    /// Pick the remote port for a tunnel
    pub fn port(&self, selection: PortSelection) -> u16 {
        match selection {
            PortSelection::Http => self.http_port,
            PortSelection::App => self.app_port,
        }
    }
}

/// Which of the endpoint's ports a tunnel targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSelection {
    #[default]
    Http,
    App,
}

/// Tunnel settings applied when a spec is built from an endpoint
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub port: PortSelection,
    pub host: String,
    /// 0 lets the system assign a port
    pub local_port: u16,
    pub emit_logs: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            port: PortSelection::Http,
            host: DEFAULT_BIND_HOST.to_string(),
            local_port: 0,
            emit_logs: false,
        }
    }
}

impl TunnelOptions {
    pub fn with_port(mut self, port: PortSelection) -> Self {
        self.port = port;
        self
    }
}

/// Immutable description of one port-forward tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    namespace: String,
    pod_name: String,
    host: IpAddr,
    local_port: u16,
    remote_port: u16,
    emit_logs: bool,
}

impl TunnelSpec {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        host: &str,
        local_port: u16,
        remote_port: u16,
        emit_logs: bool,
    ) -> Result<Self, TunnelError> {
        let namespace = namespace.into();
        let pod_name = pod_name.into();

        if namespace.is_empty() {
            return Err(TunnelError::InvalidSpec("namespace is empty".to_string()));
        }
        if pod_name.is_empty() {
            return Err(TunnelError::InvalidSpec("pod name is empty".to_string()));
        }
        if remote_port == 0 {
            return Err(TunnelError::InvalidSpec(format!(
                "remote port for pod {} is 0",
                pod_name
            )));
        }
        let host: IpAddr = host
            .parse()
            .map_err(|_| TunnelError::InvalidSpec(format!("invalid bind host '{}'", host)))?;

        Ok(Self {
            namespace,
            pod_name,
            host,
            local_port,
            remote_port,
            emit_logs,
        })
    }

    /// Build a spec targeting one of the endpoint's ports
    pub fn for_endpoint(
        endpoint: &AppEndpoint,
        options: &TunnelOptions,
    ) -> Result<Self, TunnelError> {
        Self::new(
            endpoint.namespace.clone(),
            endpoint.pod_name.clone(),
            &options.host,
            options.local_port,
            endpoint.port(options.port),
            options.emit_logs,
        )
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn emit_logs(&self) -> bool {
        self.emit_logs
    }

    /// Address the local listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.local_port)
    }
}
