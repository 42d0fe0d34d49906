//! Pod tunnels and relays for the keel CLI
//!
//! This crate opens ephemeral port-forward tunnels into cluster pods and
//! relays traffic across them:
//!
//! - [`TunnelSession`]: one local listener bridged to one pod port, with a
//!   blocking `init` and an idempotent `stop`
//! - [`RequestRelay`]: one buffered HTTP exchange through a ready tunnel
//! - [`StreamRelay`]: a persistent WebSocket whose inbound frames are
//!   classified and handed to the caller
//! - [`SignalGuard`] / [`CancelBroadcaster`]: interrupt-driven teardown
//! - [`Invoker`]: resolve, tunnel and relay in one call
//!
//! Cluster access is abstracted behind [`ClusterProvider`] and
//! [`ClusterClient`]; the `keel-kube` crate provides the production
//! implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_tunnel::{Invoker, InvokerSettings};
//!
//! let invoker = Invoker::new(provider, InvokerSettings::default())?;
//! let body = invoker.invoke_via_tunnel("core", "status", b"", "GET").await?;
//! ```

mod cluster;
mod endpoint;
mod error;
mod invoke;
pub mod relay;
mod session;
mod signal;

pub use cluster::{ClusterClient, ClusterProvider, PodIo, PodStream};
pub use endpoint::{
    AppEndpoint, PodPhase, PortSelection, TunnelOptions, TunnelSpec, DEFAULT_BIND_HOST,
};
pub use error::{InvokeError, RelayError, RequestStage, TunnelError};
pub use invoke::{Invoker, InvokerSettings, ManagedTunnel, Route};
pub use relay::{Frame, RequestRelay, StreamEnd, StreamRelay};
pub use session::{ForwardedPorts, Lifecycle, StopHandle, StopSignal, TunnelSession};
pub use signal::{
    shutdown_signal, CancelBroadcaster, CancelRegistration, SignalGuard, INTERRUPT_EXIT_CODE,
    SHUTDOWN_GRACE,
};
