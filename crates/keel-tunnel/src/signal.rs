//! Interrupt handling
//!
//! Components that own a tunnel register a callback with a shared
//! [`CancelBroadcaster`]. A [`SignalGuard`] waits for an OS interrupt, fires
//! every registered callback, waits a bounded time for tunnels to release
//! their listeners, then terminates the process.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use tokio::task::JoinHandle;

use crate::session::StopHandle;

/// Exit code used after an interrupt (128 + SIGINT)
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// How long an interrupt waits for tunnels to close before exiting
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Callback = Box<dyn Fn() + Send + Sync>;
type Released = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    callback: Callback,
    released: Option<Released>,
}

#[derive(Default)]
struct Registry {
    callbacks: DashMap<u64, Entry>,
    next_id: AtomicU64,
}

/// Central set of cancellation callbacks
#[derive(Clone, Default)]
pub struct CancelBroadcaster {
    registry: Arc<Registry>,
}

impl CancelBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run on [`fire`](Self::fire).
    ///
    /// The callback is removed when the returned registration is dropped.
    pub fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> CancelRegistration {
        self.insert(Entry {
            callback: Box::new(callback),
            released: None,
        })
    }

    /// Register a tunnel session's stop handle.
    ///
    /// [`shutdown`](Self::shutdown) also waits for the session to release
    /// its listener.
    pub fn register_stop(&self, handle: StopHandle) -> CancelRegistration {
        let stopper = handle.clone();
        self.insert(Entry {
            callback: Box::new(move || {
                stopper.stop();
            }),
            released: Some(Box::new(move || {
                let handle = handle.clone();
                Box::pin(async move { handle.released().await })
            })),
        })
    }

    fn insert(&self, entry: Entry) -> CancelRegistration {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.callbacks.insert(id, entry);
        CancelRegistration {
            id,
            registry: self.registry.clone(),
        }
    }

    /// Run every registered callback. Returns how many ran.
    pub fn fire(&self) -> usize {
        self.drain().len()
    }

    /// Fire every callback, then wait up to `grace` for the stopped
    /// sessions to release their listeners. Returns how many callbacks ran.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let fired = self.drain();
        let waits: Vec<_> = fired.iter().filter_map(|r| r.as_ref().map(|f| f())).collect();

        if tokio::time::timeout(grace, join_all(waits)).await.is_err() {
            tracing::warn!("Tunnels still closing after {:?}", grace);
        }
        fired.len()
    }

    /// Remove and run every entry, keeping their release waits
    fn drain(&self) -> Vec<Option<Released>> {
        // Collect ids first so callbacks never run under a shard lock
        let ids: Vec<u64> = self.registry.callbacks.iter().map(|e| *e.key()).collect();
        let mut fired = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.registry.callbacks.remove(&id) {
                (entry.callback)();
                fired.push(entry.released);
            }
        }
        fired
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.registry.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.callbacks.is_empty()
    }
}

/// Keeps a callback registered until dropped
pub struct CancelRegistration {
    id: u64,
    registry: Arc<Registry>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.registry.callbacks.remove(&self.id);
    }
}

/// Background listener that turns an interrupt into teardown plus exit
pub struct SignalGuard {
    handle: JoinHandle<()>,
}

impl SignalGuard {
    /// Listen for Ctrl+C / SIGTERM, fire `broadcaster`, then exit the process
    pub fn install(broadcaster: CancelBroadcaster) -> Self {
        Self::with_trigger(broadcaster, shutdown_signal(), || {
            std::process::exit(INTERRUPT_EXIT_CODE)
        })
    }

    /// Shut `broadcaster` down when `trigger` resolves, then call `on_fire`
    pub fn with_trigger<T, F>(broadcaster: CancelBroadcaster, trigger: T, on_fire: F) -> Self
    where
        T: Future<Output = ()> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            trigger.await;
            let fired = broadcaster.shutdown(SHUTDOWN_GRACE).await;
            tracing::info!("Interrupted, stopped {} tunnel(s)", fired);
            on_fire();
        });
        Self { handle }
    }

    /// True once the guard has fired (or was cancelled)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Resolves on the first Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
