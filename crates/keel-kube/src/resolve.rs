use k8s_openapi::api::core::v1::Pod;
use keel_tunnel::{AppEndpoint, PodPhase, TunnelError};

/// Label carrying the application id on sidecar-injected pods
pub const APP_ID_LABEL: &str = "dapr.io/app-id";

/// Annotation declaring the port the application listens on
pub const APP_PORT_ANNOTATION: &str = "dapr.io/app-port";

/// Name of the injected sidecar container
const SIDECAR_CONTAINER: &str = "daprd";

/// Port of the sidecar's HTTP API
pub const DEFAULT_SIDECAR_HTTP_PORT: u16 = 3500;

/// Label selector matching every pod of `app_id`
pub fn app_selector(app_id: &str) -> String {
    format!("{}={}", APP_ID_LABEL, app_id)
}

/// Pick the pod to target, preferring running ones
pub fn select_pod(pods: Vec<Pod>) -> Option<Pod> {
    let mut fallback = None;
    for pod in pods {
        if phase_of(&pod) == PodPhase::Running {
            return Some(pod);
        }
        if fallback.is_none() {
            fallback = Some(pod);
        }
    }
    fallback
}

/// Build an endpoint from a pod resolved for `app_id`
pub fn endpoint_from_pod(
    app_id: &str,
    pod: &Pod,
    sidecar_http_port: u16,
) -> Result<AppEndpoint, TunnelError> {
    let pod_name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| TunnelError::resolution(app_id, "pod has no name"))?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse().ok());

    Ok(AppEndpoint {
        app_id: app_id.to_string(),
        namespace,
        pod_name,
        http_port: sidecar_http_port,
        app_port: app_port(pod).unwrap_or(0),
        phase: phase_of(pod),
        pod_ip,
    })
}

fn phase_of(pod: &Pod) -> PodPhase {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::parse)
        .unwrap_or(PodPhase::Unknown)
}

/// App port from the annotation, else the first port of the app container
fn app_port(pod: &Pod) -> Option<u16> {
    let annotated = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(APP_PORT_ANNOTATION))
        .and_then(|p| p.trim().parse().ok());
    if annotated.is_some() {
        return annotated;
    }

    pod.spec
        .as_ref()?
        .containers
        .iter()
        .filter(|c| c.name != SIDECAR_CONTAINER)
        .filter_map(|c| c.ports.as_ref())
        .flatten()
        .find_map(|p| u16::try_from(p.container_port).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn container(name: &str, port: i32) -> Container {
        Container {
            name: name.to_string(),
            ports: Some(vec![ContainerPort {
                container_port: port,
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn pod(name: &str, phase: &str, annotations: &[(&str, &str)]) -> Pod {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("keel-system".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container("daprd", 3500), container("core", 6789)],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.42.0.17".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_endpoint_from_annotated_pod() {
        let pod = pod("core-0", "Running", &[(APP_PORT_ANNOTATION, "31234")]);
        let ep = endpoint_from_pod("core", &pod, DEFAULT_SIDECAR_HTTP_PORT).unwrap();

        assert_eq!(ep.app_id, "core");
        assert_eq!(ep.namespace, "keel-system");
        assert_eq!(ep.pod_name, "core-0");
        assert_eq!(ep.http_port, 3500);
        assert_eq!(ep.app_port, 31234);
        assert_eq!(ep.phase, PodPhase::Running);
        assert_eq!(ep.pod_ip, Some("10.42.0.17".parse().unwrap()));
    }

    #[test]
    fn test_app_port_falls_back_to_app_container() {
        let pod = pod("core-0", "Running", &[]);
        let ep = endpoint_from_pod("core", &pod, DEFAULT_SIDECAR_HTTP_PORT).unwrap();
        assert_eq!(ep.app_port, 6789);
    }

    #[test]
    fn test_select_prefers_running_pod() {
        let pods = vec![
            pod("core-old", "Pending", &[]),
            pod("core-new", "Running", &[]),
        ];
        let chosen = select_pod(pods).unwrap();
        assert_eq!(chosen.metadata.name.as_deref(), Some("core-new"));

        let pending = select_pod(vec![pod("core-old", "Pending", &[])]).unwrap();
        assert_eq!(phase_of(&pending), PodPhase::Pending);
        assert!(select_pod(Vec::new()).is_none());
    }

    #[test]
    fn test_selector() {
        assert_eq!(app_selector("core"), "dapr.io/app-id=core");
    }
}
