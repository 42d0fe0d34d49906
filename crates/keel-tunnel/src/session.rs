//! Port-forward tunnel sessions
//!
//! A [`TunnelSession`] owns exactly one local listener bridged to one port of
//! one pod. [`TunnelSession::init`] blocks until the forwarding task reports
//! either readiness (listener bound, pod channel negotiated) or failure.
//! Stopping is idempotent: the lifecycle moves `Created -> Running -> Stopped`
//! under a single lock and a stopped session stays stopped.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::cluster::{ClusterClient, PodStream};
use crate::endpoint::TunnelSpec;
use crate::TunnelError;

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Ports in use once a tunnel is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedPorts {
    /// Address the listener is bound to
    pub host: IpAddr,
    pub local: u16,
    pub remote: u16,
}

impl ForwardedPorts {
    /// Address a client dials to reach the tunnel
    pub fn local_addr(&self) -> SocketAddr {
        let host = match self.host {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(host, self.local)
    }
}

struct StopState {
    lifecycle: Mutex<Lifecycle>,
    token: CancellationToken,
    /// Set once a forwarding task has been spawned
    forwarding: AtomicBool,
    /// Cancelled when the forwarding task exits
    released: CancellationToken,
}

/// Cloneable handle that stops a session from any task
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                lifecycle: Mutex::new(Lifecycle::Created),
                token: CancellationToken::new(),
                forwarding: AtomicBool::new(false),
                released: CancellationToken::new(),
            }),
        }
    }

    /// Stop the session. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle == Lifecycle::Stopped {
            return false;
        }
        *lifecycle = Lifecycle::Stopped;
        self.inner.token.cancel();
        true
    }

    /// Receive-only view of the stop signal
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            token: self.inner.token.clone(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Resolves once the forwarding task has dropped its listener and
    /// connections. Returns at once if no task was ever started.
    pub async fn released(&self) {
        if self.inner.forwarding.load(Ordering::SeqCst) {
            self.inner.released.cancelled().await
        }
    }

    fn start_forwarding(&self) -> DropGuard {
        self.inner.forwarding.store(true, Ordering::SeqCst);
        self.inner.released.clone().drop_guard()
    }

    /// Move `Created -> Running`; fails if the session was stopped meanwhile
    fn mark_running(&self) -> Result<(), TunnelError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Running;
                Ok(())
            }
            Lifecycle::Running => Err(TunnelError::AlreadyStarted),
            Lifecycle::Stopped => Err(TunnelError::Stopped),
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Receive-only stop signal for composing with other tasks
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Resolves once the session has been stopped
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One port-forward tunnel to one pod
pub struct TunnelSession {
    id: Uuid,
    spec: TunnelSpec,
    client: Arc<dyn ClusterClient>,
    stop: StopHandle,
    ports: Option<ForwardedPorts>,
    forwarder: Option<JoinHandle<()>>,
}

impl TunnelSession {
    pub fn new(client: Arc<dyn ClusterClient>, spec: TunnelSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            client,
            stop: StopHandle::new(),
            ports: None,
            forwarder: None,
        }
    }

    /// Start forwarding and wait until the tunnel is ready or has failed.
    ///
    /// There is no timeout: if the cluster never answers, this never returns.
    /// Callers needing a bound should wrap it in `tokio::time::timeout`.
    pub async fn init(&mut self) -> Result<ForwardedPorts, TunnelError> {
        match self.stop.lifecycle() {
            Lifecycle::Stopped => return Err(TunnelError::Stopped),
            Lifecycle::Running => return Err(TunnelError::AlreadyStarted),
            Lifecycle::Created => {}
        }
        if self.forwarder.is_some() {
            return Err(TunnelError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let forwarder = Forwarder {
            id: self.id,
            spec: self.spec.clone(),
            client: self.client.clone(),
            stop: self.stop.signal(),
            _released: self.stop.start_forwarding(),
        };
        self.forwarder = Some(tokio::spawn(forwarder.run(ready_tx)));

        let ports = ready_rx.await.unwrap_or(Err(TunnelError::ForwarderLost))?;
        self.stop.mark_running()?;
        self.ports = Some(ports);

        Ok(ports)
    }

    /// Stop the tunnel; later calls are no-ops
    pub fn stop(&self) {
        if self.stop.stop() {
            tracing::debug!("Stopping tunnel {}", self.id);
        }
    }

    /// Handle that can stop this session from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.signal()
    }

    /// Wait until the forwarding task has released the listener.
    ///
    /// Only returns after the session was stopped or the listener failed.
    pub async fn closed(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            if let Err(e) = handle.await {
                tracing::error!("Tunnel {} forwarder panicked: {}", self.id, e);
            }
        }
    }

    /// Local port assigned to the tunnel; `None` until ready
    pub fn local_port(&self) -> Option<u16> {
        self.ports.map(|p| p.local)
    }

    /// Address to dial for the tunnel; `None` until ready
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ports.map(|p| p.local_addr())
    }

    pub fn ports(&self) -> Option<ForwardedPorts> {
        self.ports
    }

    pub fn is_ready(&self) -> bool {
        self.ports.is_some()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.stop.lifecycle()
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("ports", &self.ports)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Background half of a session: owns the listener and the live connections
struct Forwarder {
    id: Uuid,
    spec: TunnelSpec,
    client: Arc<dyn ClusterClient>,
    stop: StopSignal,
    _released: DropGuard,
}

impl Forwarder {
    async fn run(self, ready: oneshot::Sender<Result<ForwardedPorts, TunnelError>>) {
        // Negotiate the pod channel before binding so a failed dial leaves no listener
        let first = tokio::select! {
            _ = self.stop.stopped() => {
                let _ = ready.send(Err(TunnelError::Stopped));
                return;
            }
            result = self.open_channel() => match result {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::debug!("Tunnel {} failed to establish: {}", self.id, e);
                    let _ = ready.send(Err(e));
                    return;
                }
            }
        };

        let addr = self.spec.bind_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready.send(Err(TunnelError::Bind { addr, source }));
                return;
            }
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(source) => {
                let _ = ready.send(Err(TunnelError::Bind { addr, source }));
                return;
            }
        };

        let ports = ForwardedPorts {
            host: local.ip(),
            local: local.port(),
            remote: self.spec.remote_port(),
        };
        if self.spec.emit_logs() {
            tracing::info!("Forwarding from {} -> {}", local, ports.remote);
        } else {
            tracing::debug!("Tunnel {} forwarding {} -> {}", self.id, local, ports.remote);
        }

        if ready.send(Ok(ports)).is_err() {
            tracing::debug!("Tunnel {} abandoned before ready", self.id);
            return;
        }

        self.accept_loop(listener, first).await;
    }

    async fn accept_loop(&self, listener: TcpListener, first: PodStream) {
        let mut warm = Some(first);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.stop.stopped() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        if self.spec.emit_logs() {
                            tracing::info!("Handling connection for {}", self.spec.remote_port());
                        }
                        let bridge = Bridge {
                            id: self.id,
                            spec: self.spec.clone(),
                            client: self.client.clone(),
                        };
                        connections.spawn(bridge.run(conn, peer, warm.take()));
                    }
                    Err(e) => {
                        tracing::error!("Tunnel {} accept error: {}", self.id, e);
                        break;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Tunnel {} connection task panicked", self.id);
                        }
                    }
                }
            }
        }

        drop(listener);
        connections.shutdown().await;
        tracing::debug!("Tunnel {} closed", self.id);
    }

    async fn open_channel(&self) -> Result<PodStream, TunnelError> {
        self.client
            .open_port(
                self.spec.namespace(),
                self.spec.pod_name(),
                self.spec.remote_port(),
            )
            .await
    }
}

/// Copies bytes between one accepted local connection and one pod channel
struct Bridge {
    id: Uuid,
    spec: TunnelSpec,
    client: Arc<dyn ClusterClient>,
}

impl Bridge {
    async fn run(self, mut conn: TcpStream, peer: SocketAddr, warm: Option<PodStream>) {
        let mut channel = match warm {
            Some(channel) => channel,
            None => match self
                .client
                .open_port(
                    self.spec.namespace(),
                    self.spec.pod_name(),
                    self.spec.remote_port(),
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::error!("Tunnel {} dropped connection from {}: {}", self.id, peer, e);
                    return;
                }
            },
        };

        match tokio::io::copy_bidirectional(&mut conn, &mut channel).await {
            Ok((sent, received)) => {
                tracing::debug!(
                    "Tunnel {} connection {} done ({} bytes out, {} bytes in)",
                    self.id,
                    peer,
                    sent,
                    received
                );
            }
            Err(e) => {
                tracing::debug!("Tunnel {} connection {} ended: {}", self.id, peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::endpoint::AppEndpoint;

    /// Dials a fixed local address for every pod port
    struct LocalCluster {
        target: SocketAddr,
        behavior: DialBehavior,
        dials: AtomicUsize,
    }

    enum DialBehavior {
        Connect,
        Refuse,
        Hang,
    }

    #[async_trait]
    impl ClusterClient for LocalCluster {
        async fn resolve_pod(&self, identifier: &str) -> Result<AppEndpoint, TunnelError> {
            Err(TunnelError::resolution(identifier, "not used"))
        }

        async fn open_port(
            &self,
            namespace: &str,
            pod: &str,
            port: u16,
        ) -> Result<PodStream, TunnelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                DialBehavior::Connect => {
                    let stream = TcpStream::connect(self.target)
                        .await
                        .map_err(|e| TunnelError::establish(namespace, pod, port, e))?;
                    Ok(Box::new(stream))
                }
                DialBehavior::Refuse => Err(TunnelError::establish(
                    namespace,
                    pod,
                    port,
                    "upgrade rejected",
                )),
                DialBehavior::Hang => std::future::pending().await,
            }
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn session(behavior: DialBehavior) -> (TunnelSession, Arc<LocalCluster>) {
        let cluster = Arc::new(LocalCluster {
            target: echo_server().await,
            behavior,
            dials: AtomicUsize::new(0),
        });
        let spec = TunnelSpec::new("default", "echo-0", "127.0.0.1", 0, 7000, false).unwrap();
        (TunnelSession::new(cluster.clone(), spec), cluster)
    }

    #[tokio::test]
    async fn test_init_binds_dialable_port() {
        let (mut session, _) = session(DialBehavior::Connect).await;

        let ports = session.init().await.expect("init failed");
        assert_eq!(ports.remote, 7000);
        assert_ne!(ports.local, 0);
        assert_eq!(session.local_port(), Some(ports.local));
        assert_eq!(session.lifecycle(), Lifecycle::Running);

        let mut conn = TcpStream::connect(("127.0.0.1", ports.local))
            .await
            .expect("local port not dialable after init");
        conn.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_each_connection_gets_a_channel() {
        let (mut session, cluster) = session(DialBehavior::Connect).await;
        let port = session.init().await.unwrap().local;
        assert_eq!(cluster.dials.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            conn.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            conn.read_exact(&mut buf).await.unwrap();
        }

        // The channel negotiated during init serves the first connection
        assert_eq!(cluster.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let (mut session, _) = session(DialBehavior::Connect).await;
        let port = session.init().await.unwrap().local;
        let signal = session.stop_signal();

        session.stop();
        session.stop();
        assert!(!session.stop_handle().stop());
        assert_eq!(session.lifecycle(), Lifecycle::Stopped);

        tokio::time::timeout(Duration::from_secs(5), signal.stopped())
            .await
            .expect("stop signal never fired");
        session.closed().await;

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_dial_never_fires_ready() {
        let (mut session, _) = session(DialBehavior::Refuse).await;

        let err = session.init().await.unwrap_err();
        assert!(matches!(err, TunnelError::Establish { .. }));
        assert!(err.to_string().contains("upgrade rejected"));
        assert!(!session.is_ready());
        assert_eq!(session.local_port(), None);
        assert_eq!(session.lifecycle(), Lifecycle::Created);

        // A failed session can still be stopped cleanly
        session.stop();
        session.closed().await;
    }

    #[tokio::test]
    async fn test_init_twice_rejected() {
        let (mut session, _) = session(DialBehavior::Connect).await;
        session.init().await.unwrap();
        assert!(matches!(
            session.init().await,
            Err(TunnelError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_init_after_stop_rejected() {
        let (mut session, cluster) = session(DialBehavior::Connect).await;
        session.stop();
        assert!(matches!(session.init().await, Err(TunnelError::Stopped)));
        assert_eq!(cluster.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_unblocks_pending_init() {
        let (mut session, _) = session(DialBehavior::Hang).await;
        let handle = session.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), session.init())
            .await
            .expect("init did not observe stop");
        assert!(matches!(result, Err(TunnelError::Stopped)));
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_drop_releases_listener() {
        let (mut session, _) = session(DialBehavior::Connect).await;
        let port = session.init().await.unwrap().local;
        let handle = session.stop_handle();

        drop(session);
        tokio::time::timeout(Duration::from_secs(5), handle.released())
            .await
            .expect("forwarder never released the listener");
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_released_without_forwarder_returns_at_once() {
        let (session, _) = session(DialBehavior::Connect).await;
        let handle = session.stop_handle();
        session.stop();

        tokio::time::timeout(Duration::from_millis(100), handle.released())
            .await
            .expect("a session that never started has nothing to release");
    }

    #[tokio::test]
    async fn test_local_addr_follows_bind_host() {
        let (mut session, _) = session(DialBehavior::Connect).await;
        let ports = session.init().await.unwrap();

        assert_eq!(ports.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            session.local_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, ports.local)))
        );
    }

    #[test]
    fn test_unspecified_host_dials_loopback() {
        let v4 = ForwardedPorts {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local: 4000,
            remote: 80,
        };
        assert_eq!(v4.local_addr(), "127.0.0.1:4000".parse().unwrap());

        let v6 = ForwardedPorts {
            host: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            local: 4000,
            remote: 80,
        };
        assert_eq!(v6.local_addr(), "[::1]:4000".parse().unwrap());
    }
}
