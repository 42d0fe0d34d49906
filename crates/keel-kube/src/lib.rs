//! Kubernetes collaborators for keel tunnels
//!
//! Provides the production [`ClusterProvider`](keel_tunnel::ClusterProvider)
//! and [`ClusterClient`](keel_tunnel::ClusterClient) on top of the `kube`
//! crate:
//!
//! - credentials come from the ambient kubeconfig or the in-cluster service
//!   account
//! - apps are resolved by the `dapr.io/app-id` pod label
//! - pod channels are opened through the API server's port-forward
//!   subresource
//! - proxied invokes go through the pod proxy subresource

mod client;
mod resolve;

pub use client::{proxy_path, KubeCluster, KubeOptions, KubeProvider};
pub use resolve::{
    app_selector, endpoint_from_pod, select_pod, APP_ID_LABEL, APP_PORT_ANNOTATION,
    DEFAULT_SIDECAR_HTTP_PORT,
};
