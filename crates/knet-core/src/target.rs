//! Diagnostic targets and their resolution against live pods.

use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

use crate::error::{GatewayError, SessionError};
use crate::gateway::{WorkloadGateway, is_finished, pod_name, pod_phase};

/// A pod (and optionally one container) to diagnose.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    /// Defaults to the pod's first container.
    pub container: Option<String>,
}

impl Target {
    #[must_use]
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    #[must_use]
    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let Some(container) = &self.container {
            write!(f, ":{container}")?;
        }
        Ok(())
    }
}

/// A target checked against its pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTarget {
    pub namespace: String,
    pub pod: String,
    /// Container the sidecar attaches to
    pub container: String,
    pub node_name: Option<String>,
    /// Container runtime, e.g. `containerd`
    pub runtime: Option<String>,
    pub container_id: Option<String>,
}

/// Split a `runtime://id` container id.
#[must_use]
pub fn parse_container_id(raw: &str) -> Option<(String, String)> {
    let (runtime, id) = raw.split_once("://")?;
    if runtime.is_empty() || id.is_empty() {
        return None;
    }
    Some((runtime.to_string(), id.to_string()))
}

/// Check that `pod` can host a sidecar for `target`.
///
/// Finished pods are rejected, an explicit container must exist, and the
/// first container is chosen otherwise.
pub fn resolve(pod: &Pod, target: &Target) -> Result<ResolvedTarget, SessionError> {
    if is_finished(pod) {
        return Err(SessionError::TerminalState {
            pod: target.pod.clone(),
            phase: pod_phase(pod).unwrap_or("Unknown").to_string(),
        });
    }

    let spec = pod.spec.as_ref().ok_or_else(|| {
        SessionError::Validation(format!("pod {} has no spec", pod_name(pod)))
    })?;
    let Some(first) = spec.containers.first() else {
        return Err(SessionError::Validation(format!(
            "pod {} has no containers",
            target.pod
        )));
    };

    let container = match &target.container {
        Some(wanted) => {
            if !spec.containers.iter().any(|c| &c.name == wanted) {
                let known: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
                return Err(SessionError::Validation(format!(
                    "container {wanted} not found in pod {} (containers: {})",
                    target.pod,
                    known.join(", ")
                )));
            }
            wanted.clone()
        }
        None => first.name.clone(),
    };

    let (runtime, container_id) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|list| list.iter().find(|c| c.name == container))
        .and_then(|c| c.container_id.as_deref())
        .and_then(parse_container_id)
        .map_or((None, None), |(runtime, id)| (Some(runtime), Some(id)));

    Ok(ResolvedTarget {
        namespace: target.namespace.clone(),
        pod: target.pod.clone(),
        container,
        node_name: spec.node_name.clone(),
        runtime,
        container_id,
    })
}

/// Expand explicit pod names plus an optional label selector into targets.
///
/// Duplicates collapse; order is stable. A selector that matches nothing
/// yields no extra targets.
pub async fn collect_targets(
    gateway: &dyn WorkloadGateway,
    namespace: &str,
    pods: &[String],
    selector: Option<&str>,
    container: Option<&str>,
) -> Result<Vec<Target>, GatewayError> {
    let mut names: BTreeSet<String> = pods.iter().cloned().collect();
    if let Some(selector) = selector {
        for pod in gateway.list(namespace, selector).await? {
            if let Some(name) = pod.metadata.name {
                names.insert(name);
            }
        }
    }
    Ok(names
        .into_iter()
        .map(|name| Target::new(namespace, name).with_container(container.map(str::to_string)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(phase: &str, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                containers: containers
                    .iter()
                    .map(|n| Container {
                        name: (*n).to_string(),
                        ..Container::default()
                    })
                    .collect(),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|n| ContainerStatus {
                            name: (*n).to_string(),
                            container_id: Some(format!("containerd://{n}-id")),
                            ..ContainerStatus::default()
                        })
                        .collect(),
                ),
                ..PodStatus::default()
            }),
        }
    }

    #[test]
    fn defaults_to_first_container() {
        let resolved = resolve(&pod("Running", &["app", "proxy"]), &Target::new("ns", "web-0")).unwrap();
        assert_eq!(resolved.container, "app");
        assert_eq!(resolved.node_name.as_deref(), Some("node-a"));
        assert_eq!(resolved.runtime.as_deref(), Some("containerd"));
        assert_eq!(resolved.container_id.as_deref(), Some("app-id"));
    }

    #[test]
    fn explicit_container_must_exist() {
        let target = Target::new("ns", "web-0").with_container(Some("proxy".to_string()));
        assert_eq!(resolve(&pod("Running", &["app", "proxy"]), &target).unwrap().container, "proxy");

        let missing = Target::new("ns", "web-0").with_container(Some("db".to_string()));
        let err = resolve(&pod("Running", &["app"]), &missing).unwrap_err();
        assert!(matches!(err, SessionError::Validation(ref m) if m.contains("db")));
    }

    #[test]
    fn finished_pods_are_terminal() {
        for phase in ["Succeeded", "Failed"] {
            let err = resolve(&pod(phase, &["app"]), &Target::new("ns", "web-0")).unwrap_err();
            assert!(matches!(err, SessionError::TerminalState { phase: ref p, .. } if p == phase));
        }
    }

    #[test]
    fn pods_without_containers_are_invalid() {
        let err = resolve(&pod("Running", &[]), &Target::new("ns", "web-0")).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn container_id_parsing() {
        assert_eq!(
            parse_container_id("cri-o://abc123"),
            Some(("cri-o".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_container_id("abc123"), None);
        assert_eq!(parse_container_id("docker://"), None);
    }

    #[test]
    fn target_display() {
        assert_eq!(Target::new("ns", "web-0").to_string(), "ns/web-0");
        assert_eq!(
            Target::new("ns", "web-0")
                .with_container(Some("app".to_string()))
                .to_string(),
            "ns/web-0:app"
        );
    }
}
