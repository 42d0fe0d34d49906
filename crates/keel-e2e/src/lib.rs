//! End-to-end test utilities for keel tunnels
//!
//! Tunnels normally reach pods through the cluster API. Here a
//! [`LoopbackCluster`] maps pod ports to local listeners instead, so the
//! full resolve, tunnel and relay path runs against in-process mocks.

pub mod loopback;
pub mod mock_sidecar;
pub mod mock_stream;

pub use loopback::LoopbackCluster;
pub use mock_sidecar::{MockSidecar, RecordedRequest};
pub use mock_stream::{MockStreamApp, StreamMode};

