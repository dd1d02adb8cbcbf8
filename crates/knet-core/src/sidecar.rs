//! Sidecar descriptors
//!
//! A sidecar is an ephemeral container added to a running pod. It shares the
//! target container's process namespace and idles on `sleep` so diagnostic
//! commands can be exec'ed into it.

use std::time::Duration;

use k8s_openapi::api::core::v1::EphemeralContainer;
use uuid::Uuid;

/// Name prefix of every injected sidecar.
pub const SIDECAR_PREFIX: &str = "knet-";

/// Generate a fresh sidecar name, `knet-` plus 10 hex characters.
#[must_use]
pub fn generate_sidecar_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{SIDECAR_PREFIX}{}", &id[..10])
}

/// One ephemeral container to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarDescriptor {
    pub name: String,
    pub image: String,
    pub target_container: String,
    pub lifetime: Duration,
}

impl SidecarDescriptor {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        target_container: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            target_container: target_container.into(),
            lifetime,
        }
    }

    /// The API object appended to `spec.ephemeralContainers`.
    #[must_use]
    pub fn to_ephemeral_container(&self) -> EphemeralContainer {
        EphemeralContainer {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["sleep".to_string()]),
            args: Some(vec![self.lifetime.as_secs().to_string()]),
            target_container_name: Some(self.target_container.clone()),
            stdin: Some(false),
            tty: Some(false),
            ..EphemeralContainer::default()
        }
    }
}
