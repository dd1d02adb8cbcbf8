//! Fleet agent lifecycle
//!
//! Installs and removes the node-level runtime agent: RBAC, the agent
//! DaemonSet and the runtime classes it provides. Teardown runs a cleanup
//! DaemonSet that resets every node before the RBAC goes away.
//!
//! Errors propagate; a `NotFound` on delete counts as already deleted.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, SecurityContext, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::node::v1::{Overhead, RuntimeClass, Scheduling};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::gateway::{ExecRequest, FleetResource, ResourceKind, ResourceRef, SharedGateway, pod_name};
use crate::poll::{PollSchedule, ReadinessPredicate, Selector, all_absent, all_running, poll};
use crate::stream::{LogLines, RemoteCommand};

pub const AGENT_NAME: &str = "kata-deploy";
pub const CLEANUP_NAME: &str = "kubelet-kata-cleanup";
/// Container name in both DaemonSets
pub const AGENT_CONTAINER: &str = "kube-kata";
pub const SERVICE_ACCOUNT: &str = "kata-label-node";
pub const CLUSTER_ROLE: &str = "node-labeler";
pub const CLUSTER_ROLE_BINDING: &str = "kata-label-node-rb";

/// Runtime classes with their fixed pod overhead (cpu, memory).
pub const RUNTIME_CLASSES: [(&str, &str, &str); 4] = [
    ("kata-qemu", "250m", "160Mi"),
    ("kata-clh", "250m", "130Mi"),
    ("kata-fc", "250m", "130Mi"),
    ("kata-dragonball", "250m", "130Mi"),
];

const SHIMS: [&str; 4] = ["qemu", "clh", "fc", "dragonball"];
const DEPLOY_SCRIPT: &str = "/opt/kata-artifacts/scripts/kata-deploy.sh";
const RUNTIME_LABEL: &str = "katacontainers.io/kata-runtime";

fn selector_for(name: &str) -> String {
    format!("name={name}")
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..ObjectMeta::default()
    }
}

/// Service account, cluster role and binding the agent runs under.
#[must_use]
pub fn rbac_resources(namespace: &str) -> Vec<FleetResource> {
    let account = ServiceAccount {
        metadata: meta(SERVICE_ACCOUNT, Some(namespace)),
        ..ServiceAccount::default()
    };
    let role = ClusterRole {
        metadata: meta(CLUSTER_ROLE, None),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["nodes".to_string()]),
            verbs: vec!["get".to_string(), "patch".to_string()],
            ..PolicyRule::default()
        }]),
        ..ClusterRole::default()
    };
    let binding = ClusterRoleBinding {
        metadata: meta(CLUSTER_ROLE_BINDING, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Subject::default()
        }]),
    };
    vec![
        FleetResource::ServiceAccount(account),
        FleetResource::ClusterRole(role),
        FleetResource::ClusterRoleBinding(binding),
    ]
}

fn host_path(name: &str, path: &str, kind: Option<&str>) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                type_: kind.map(str::to_string),
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..VolumeMount::default()
        },
    )
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn node_daemonset(name: &str, namespace: &str, image: &str, command: &str) -> DaemonSet {
    let labels = BTreeMap::from([("name".to_string(), name.to_string())]);
    let (volumes, mounts): (Vec<Volume>, Vec<VolumeMount>) = [
        host_path("crio-conf", "/etc/crio/", None),
        host_path("containerd-conf", "/etc/containerd/", None),
        host_path("kata-artifacts", "/opt/kata/", Some("DirectoryOrCreate")),
        host_path("local-bin", "/usr/local/bin/", None),
    ]
    .into_iter()
    .unzip();

    let container = Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["bash".to_string(), "-c".to_string(), command.to_string()]),
        env: Some(vec![
            EnvVar {
                name: "NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        ..ObjectFieldSelector::default()
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
            env("DEBUG", "false"),
            env("SHIMS", &SHIMS.join(" ")),
            env("DEFAULT_SHIM", "qemu"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(mounts),
        ..Container::default()
    };

    DaemonSet {
        metadata: meta(name, Some(namespace)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    host_pid: Some(true),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..PodSpec::default()
                }),
            },
            ..DaemonSetSpec::default()
        }),
        ..DaemonSet::default()
    }
}

/// DaemonSet that installs the runtime on every node.
#[must_use]
pub fn agent_daemonset(namespace: &str, image: &str) -> DaemonSet {
    node_daemonset(
        AGENT_NAME,
        namespace,
        image,
        &format!("{DEPLOY_SCRIPT} install && sleep infinity"),
    )
}

/// DaemonSet whose pods run the per-node reset when exec'ed.
#[must_use]
pub fn cleanup_daemonset(namespace: &str, image: &str) -> DaemonSet {
    node_daemonset(CLEANUP_NAME, namespace, image, "sleep infinity")
}

/// Runtime class with fixed pod overhead, scheduled onto agent nodes.
#[must_use]
pub fn runtime_class(name: &str, cpu: &str, memory: &str) -> RuntimeClass {
    RuntimeClass {
        metadata: meta(name, None),
        handler: name.to_string(),
        overhead: Some(Overhead {
            pod_fixed: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])),
        }),
        scheduling: Some(Scheduling {
            node_selector: Some(BTreeMap::from([(
                RUNTIME_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Scheduling::default()
        }),
    }
}

/// Shell command toggling the debug console in every shim configuration.
#[must_use]
pub fn debug_console_command(enabled: bool) -> Vec<String> {
    let replacement = if enabled {
        "debug_console_enabled = true"
    } else {
        "#debug_console_enabled = true"
    };
    let script = format!(
        "for var in {shims}; do sed -i 's/.*debug_console_enabled.*/{replacement}/' \
         /opt/kata/share/defaults/kata-containers/configuration-$var.toml; done",
        shims = SHIMS.join(" "),
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

fn reset_command() -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        format!("{DEPLOY_SCRIPT} reset"),
    ]
}

/// Drives agent install, teardown and configuration.
pub struct FleetManager {
    gateway: SharedGateway,
    config: FleetConfig,
}

impl FleetManager {
    #[must_use]
    pub fn new(gateway: SharedGateway, config: FleetConfig) -> Self {
        Self { gateway, config }
    }

    fn schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Duration::from_millis(self.config.poll_interval_ms),
            Duration::from_secs(self.config.wait_timeout_secs),
        )
    }

    /// Install RBAC, the agent, then the runtime classes once agents run.
    pub async fn deploy(&self, cancel: &CancellationToken) -> Result<()> {
        let ns = self.config.namespace.as_str();
        for resource in rbac_resources(ns) {
            self.create(resource).await?;
        }
        self.create(FleetResource::DaemonSet(agent_daemonset(
            ns,
            &self.config.agent_image,
        )))
        .await?;

        info!(selector = %selector_for(AGENT_NAME), "Waiting for agent pods");
        self.wait(AGENT_NAME, &all_running(), cancel).await?;

        for (name, cpu, memory) in RUNTIME_CLASSES {
            self.create(FleetResource::RuntimeClass(runtime_class(name, cpu, memory)))
                .await?;
        }
        info!("Fleet agent deployed");
        Ok(())
    }

    /// Remove the agent, reset every node, then remove RBAC and runtime classes.
    pub async fn teardown(&self, cancel: &CancellationToken) -> Result<()> {
        let ns = self.config.namespace.as_str();

        self.delete(ResourceRef {
            kind: ResourceKind::DaemonSet,
            namespace: Some(ns.to_string()),
            name: AGENT_NAME.to_string(),
        })
        .await?;
        self.wait(AGENT_NAME, &all_absent(), cancel).await?;

        self.create(FleetResource::DaemonSet(cleanup_daemonset(
            ns,
            &self.config.agent_image,
        )))
        .await?;
        self.wait(CLEANUP_NAME, &all_running(), cancel).await?;

        let reset = self.exec_in_pods(CLEANUP_NAME, reset_command(), cancel).await?;
        info!(nodes = reset, "Nodes reset");

        self.delete(ResourceRef {
            kind: ResourceKind::DaemonSet,
            namespace: Some(ns.to_string()),
            name: CLEANUP_NAME.to_string(),
        })
        .await?;
        self.wait(CLEANUP_NAME, &all_absent(), cancel).await?;

        for resource in rbac_resources(ns) {
            self.delete(resource.reference()).await?;
        }
        for (name, _, _) in RUNTIME_CLASSES {
            self.delete(ResourceRef {
                kind: ResourceKind::RuntimeClass,
                namespace: None,
                name: name.to_string(),
            })
            .await?;
        }
        info!("Fleet agent removed");
        Ok(())
    }

    /// Toggle the debug console on every agent node.
    pub async fn configure_debug_console(
        &self,
        enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.wait(AGENT_NAME, &all_running(), cancel).await?;
        let nodes = self
            .exec_in_pods(AGENT_NAME, debug_console_command(enabled), cancel)
            .await?;
        info!(nodes, enabled, "Debug console configured");
        Ok(())
    }

    async fn create(&self, resource: FleetResource) -> Result<()> {
        let reference = resource.reference();
        match self.gateway.create_resource(&resource).await {
            Ok(()) => {
                info!(%reference, "Created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                warn!(%reference, "Already present; keeping existing object");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, reference: ResourceRef) -> Result<()> {
        match self.gateway.delete_resource(&reference).await {
            Ok(()) => {
                info!(%reference, "Deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(%reference, "Already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait<P: ReadinessPredicate>(
        &self,
        name: &str,
        predicate: &P,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let selector = Selector::labels(&self.config.namespace, selector_for(name));
        poll(&*self.gateway, &selector, predicate, self.schedule(), cancel).await?;
        Ok(())
    }

    /// Exec `command` in every pod of the named DaemonSet; returns the pod count.
    async fn exec_in_pods(
        &self,
        name: &str,
        command: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let ns = self.config.namespace.as_str();
        let pods = self.gateway.list(ns, &selector_for(name)).await?;
        if pods.is_empty() {
            return Err(Error::Fleet(format!("no {name} pods found in {ns}")));
        }

        for pod in &pods {
            let pod = pod_name(pod);
            info!(pod, "Running node command");
            let request = ExecRequest::capture(ns, pod, AGENT_CONTAINER, command.clone());
            let channels = self.gateway.open_exec(&request).await?;
            let mut stdout = LogLines::new(format!("{pod}/stdout"));
            let mut stderr = LogLines::new(format!("{pod}/stderr"));
            let summary = RemoteCommand::from(channels)
                .pump(&mut stdout, &mut stderr, cancel)
                .await?;
            if summary.stopped_by_operator {
                return Err(Error::Cancelled(format!("node command in {pod} interrupted")));
            }
        }
        Ok(pods.len())
    }
}
