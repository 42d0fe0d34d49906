//! Tunnel session lifecycle and interrupt teardown tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_e2e::loopback::NAMESPACE;
use keel_e2e::LoopbackCluster;
use keel_tunnel::{
    CancelBroadcaster, InvokeError, Invoker, InvokerSettings, Lifecycle, SignalGuard,
    TunnelError, TunnelSession, TunnelSpec,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("keel_tunnel=debug,keel_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// TCP echo listener standing in for a pod port
async fn echo_pod() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn cluster_with_echo(pod: &str, port: u16) -> LoopbackCluster {
    let cluster = LoopbackCluster::new();
    cluster.expose(NAMESPACE, pod, port, echo_pod().await);
    cluster
}

async fn roundtrip(port: u16, message: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("Tunnel port not dialable");
    stream.write_all(message).await.unwrap();

    let mut buf = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Read timeout")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_forward_is_dialable_once_init_returns() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    let invoker = Invoker::new(Arc::new(cluster.clone()), InvokerSettings::default()).unwrap();

    let tunnel = invoker.forward(NAMESPACE, "db-0", 5432, 0).await.unwrap();
    let ports = tunnel.ports().unwrap();
    assert_eq!(ports.remote, 5432);
    assert_ne!(ports.local, 0);
    assert_eq!(tunnel.lifecycle(), Lifecycle::Running);

    // No sleep: a successful init means the listener is already bound
    assert_eq!(roundtrip(ports.local, b"ping").await, b"ping");
    assert_eq!(roundtrip(ports.local, b"again").await, b"again");

    // The second connection needed its own channel
    assert_eq!(cluster.dial_count(), 2);
}

#[tokio::test]
async fn test_stop_twice_is_harmless() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    let spec = TunnelSpec::new(NAMESPACE, "db-0", "127.0.0.1", 0, 5432, false).unwrap();
    let mut session = TunnelSession::new(Arc::new(cluster), spec);
    session.init().await.unwrap();

    let handle = session.stop_handle();
    assert!(handle.stop());
    assert!(!handle.stop());
    session.stop();

    assert_eq!(session.lifecycle(), Lifecycle::Stopped);
    assert!(session.stop_signal().is_stopped());
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("Forwarder did not exit after stop");
}

#[tokio::test]
async fn test_failed_dial_never_becomes_ready() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    cluster.refuse_dials(true);

    let spec = TunnelSpec::new(NAMESPACE, "db-0", "127.0.0.1", 0, 5432, false).unwrap();
    let mut session = TunnelSession::new(Arc::new(cluster.clone()), spec);

    let err = session.init().await.unwrap_err();
    assert!(matches!(err, TunnelError::Establish { .. }));
    assert!(!session.is_ready());
    assert!(session.local_port().is_none());
    assert_ne!(session.lifecycle(), Lifecycle::Running);
}

#[tokio::test]
async fn test_forward_to_unknown_port_fails() {
    init_test();
    let cluster = LoopbackCluster::new();
    let invoker = Invoker::new(Arc::new(cluster.clone()), InvokerSettings::default()).unwrap();

    let err = invoker.forward(NAMESPACE, "db-0", 5432, 0).await.err().unwrap();
    assert!(matches!(err, InvokeError::Tunnel(TunnelError::Establish { .. })));
    assert!(invoker.broadcaster().is_empty());
}

#[tokio::test]
async fn test_stop_during_pending_init() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    cluster.set_dial_delay(Duration::from_secs(30));

    let spec = TunnelSpec::new(NAMESPACE, "db-0", "127.0.0.1", 0, 5432, false).unwrap();
    let mut session = TunnelSession::new(Arc::new(cluster), spec);
    let handle = session.stop_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), session.init())
        .await
        .expect("Stop did not unblock init")
        .unwrap_err();
    assert!(matches!(err, TunnelError::Stopped));
    assert!(!session.is_ready());
}

#[tokio::test]
async fn test_broadcaster_fire_stops_forward() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    let broadcaster = CancelBroadcaster::new();
    let invoker = Invoker::new(Arc::new(cluster), InvokerSettings::default())
        .unwrap()
        .with_broadcaster(broadcaster.clone());

    let mut tunnel = invoker.forward(NAMESPACE, "db-0", 5432, 0).await.unwrap();
    let local = tunnel.local_port().unwrap();
    assert_eq!(broadcaster.len(), 1);

    assert_eq!(broadcaster.fire(), 1);
    assert_eq!(tunnel.lifecycle(), Lifecycle::Stopped);

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .expect("Forwarder did not exit after interrupt");
    assert!(TcpStream::connect(("127.0.0.1", local)).await.is_err());
}

#[tokio::test]
async fn test_signal_guard_tears_down_then_exits() {
    init_test();
    let cluster = cluster_with_echo("db-0", 5432).await;
    let broadcaster = CancelBroadcaster::new();
    let invoker = Invoker::new(Arc::new(cluster), InvokerSettings::default())
        .unwrap()
        .with_broadcaster(broadcaster.clone());

    let first = invoker.forward(NAMESPACE, "db-0", 5432, 0).await.unwrap();
    let second = invoker.forward(NAMESPACE, "db-0", 5432, 0).await.unwrap();
    let ports = [first.local_port().unwrap(), second.local_port().unwrap()];

    let (trigger_tx, trigger_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel();
    let exited = Arc::new(AtomicBool::new(false));

    let guard = {
        let exited = exited.clone();
        SignalGuard::with_trigger(
            broadcaster.clone(),
            async move {
                let _ = trigger_rx.await;
            },
            move || {
                exited.store(true, Ordering::SeqCst);
                let _ = exit_tx.send(());
            },
        )
    };

    assert!(!exited.load(Ordering::SeqCst));
    trigger_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), exit_rx)
        .await
        .expect("Guard did not fire")
        .unwrap();

    // Every tunnel was stopped before the exit hook ran
    assert_eq!(first.lifecycle(), Lifecycle::Stopped);
    assert_eq!(second.lifecycle(), Lifecycle::Stopped);
    assert!(broadcaster.is_empty());
    assert!(exited.load(Ordering::SeqCst));

    // Listeners were released before the exit hook, not after
    for port in ports {
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
    drop(guard);
}
