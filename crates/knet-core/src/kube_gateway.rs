//! Kubernetes-backed [`WorkloadGateway`].

use std::fmt::Debug;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::api::node::v1::RuntimeClass;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::{
    BoxedReader, BoxedWriter, ExecChannels, ExecRequest, FleetResource, RemoteStatus,
    ResourceKind, ResourceRef, WorkloadGateway,
};

/// Gateway over a `kube::Client`.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the local kubeconfig or in-cluster service account.
    pub async fn connect() -> Result<Self, GatewayError> {
        let client = Client::try_default()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error onto the gateway taxonomy.
fn map_error(err: kube::Error, kind: &str, namespace: &str, name: &str) -> GatewayError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => GatewayError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            GatewayError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => GatewayError::Conflict {
            name: name.to_string(),
            message: resp.message,
        },
        kube::Error::Api(resp) => GatewayError::Api {
            code: resp.code,
            reason: resp.reason,
            message: resp.message,
        },
        kube::Error::SerdeError(e) => GatewayError::Encoding(e.to_string()),
        other => GatewayError::Transport(other.to_string()),
    }
}

/// Decode the exit status an exec stream reports.
///
/// Success is `status: Success`. A non-zero exit is `reason:
/// NonZeroExitCode` with an `ExitCode` cause whose message is the code.
#[must_use]
pub fn decode_status(status: &Status) -> RemoteStatus {
    if status.status.as_deref() == Some("Success") {
        return RemoteStatus::Success;
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.trim().parse::<i32>().ok());
        if let Some(code) = code {
            return RemoteStatus::Exit(code);
        }
    }
    RemoteStatus::Failure(
        status
            .message
            .clone()
            .unwrap_or_else(|| "remote command failed".to_string()),
    )
}

async fn create_with<K>(api: Api<K>, object: &K, kind: ResourceKind) -> Result<(), GatewayError>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = object.name_any();
    let namespace = object.namespace().unwrap_or_default();
    api.create(&PostParams::default(), object)
        .await
        .map_err(|e| map_error(e, kind.as_str(), &namespace, &name))?;
    debug!(%kind, %name, "Created");
    Ok(())
}

async fn delete_with<K>(api: Api<K>, reference: &ResourceRef) -> Result<(), GatewayError>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let namespace = reference.namespace.clone().unwrap_or_default();
    api.delete(&reference.name, &DeleteParams::default())
        .await
        .map_err(|e| map_error(e, reference.kind.as_str(), &namespace, &reference.name))?;
    debug!(%reference, "Deleted");
    Ok(())
}

#[async_trait]
impl WorkloadGateway for KubeGateway {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| map_error(e, "Pod", namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let params = ListParams::default().labels(label_selector);
        self.pods(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| map_error(e, "Pod", namespace, label_selector))
    }

    async fn patch_ephemeral(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &[u8],
    ) -> Result<Pod, GatewayError> {
        let body: serde_json::Value = serde_json::from_slice(merge_patch)
            .map_err(|e| GatewayError::Encoding(e.to_string()))?;
        self.pods(namespace)
            .patch_subresource(
                "ephemeralcontainers",
                name,
                &PatchParams::default(),
                &Patch::Merge(&body),
            )
            .await
            .map_err(|e| map_error(e, "Pod", namespace, name))
    }

    async fn open_exec(&self, request: &ExecRequest) -> Result<ExecChannels, GatewayError> {
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(request.stdin)
            .stdout(request.stdout)
            .stderr(request.stderr);
        let mut process = self
            .pods(&request.namespace)
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(|e| map_error(e, "Pod", &request.namespace, &request.pod))?;

        let stdin = process.stdin().map(|w| Box::new(w) as BoxedWriter);
        let stdout = process.stdout().map(|r| Box::new(r) as BoxedReader);
        let stderr = process.stderr().map(|r| Box::new(r) as BoxedReader);
        let status_future = process.take_status();

        let status = async move {
            let status = match status_future {
                Some(fut) => fut.await,
                None => None,
            };
            // The websocket task lives as long as the process handle.
            drop(process);
            status.as_ref().map(decode_status)
        }
        .boxed();

        Ok(ExecChannels {
            stdin,
            stdout,
            stderr,
            status,
        })
    }

    async fn create_resource(&self, resource: &FleetResource) -> Result<(), GatewayError> {
        let client = self.client.clone();
        match resource {
            FleetResource::ServiceAccount(sa) => {
                let ns = sa.namespace().unwrap_or_default();
                create_with(Api::<ServiceAccount>::namespaced(client, &ns), sa, resource.kind()).await
            }
            FleetResource::DaemonSet(ds) => {
                let ns = ds.namespace().unwrap_or_default();
                create_with(Api::<DaemonSet>::namespaced(client, &ns), ds, resource.kind()).await
            }
            FleetResource::ClusterRole(role) => {
                create_with(Api::<ClusterRole>::all(client), role, resource.kind()).await
            }
            FleetResource::ClusterRoleBinding(binding) => {
                create_with(Api::<ClusterRoleBinding>::all(client), binding, resource.kind()).await
            }
            FleetResource::RuntimeClass(rc) => {
                create_with(Api::<RuntimeClass>::all(client), rc, resource.kind()).await
            }
        }
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), GatewayError> {
        let client = self.client.clone();
        let ns = resource.namespace.clone().unwrap_or_default();
        match resource.kind {
            ResourceKind::ServiceAccount => {
                delete_with(Api::<ServiceAccount>::namespaced(client, &ns), resource).await
            }
            ResourceKind::DaemonSet => {
                delete_with(Api::<DaemonSet>::namespaced(client, &ns), resource).await
            }
            ResourceKind::ClusterRole => delete_with(Api::<ClusterRole>::all(client), resource).await,
            ResourceKind::ClusterRoleBinding => {
                delete_with(Api::<ClusterRoleBinding>::all(client), resource).await
            }
            ResourceKind::RuntimeClass => {
                delete_with(Api::<RuntimeClass>::all(client), resource).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn status_success() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(decode_status(&status), RemoteStatus::Success);
    }

    #[test]
    fn status_non_zero_exit_code() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            message: Some("command terminated with non-zero exit code".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("2".to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(decode_status(&status), RemoteStatus::Exit(2));
    }

    #[test]
    fn status_failure_without_code() {
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("container not found".to_string()),
            ..Status::default()
        };
        assert_eq!(
            decode_status(&status),
            RemoteStatus::Failure("container not found".to_string())
        );
    }

    #[test]
    fn api_errors_map_to_taxonomy() {
        assert!(map_error(api_error(404, "NotFound"), "Pod", "ns", "web").is_not_found());
        assert!(map_error(api_error(409, "Conflict"), "Pod", "ns", "web").is_conflict());
        assert!(map_error(api_error(409, "AlreadyExists"), "DaemonSet", "ns", "agent").is_already_exists());
        assert!(matches!(
            map_error(api_error(403, "Forbidden"), "Pod", "ns", "web"),
            GatewayError::Api { code: 403, .. }
        ));
    }
}
