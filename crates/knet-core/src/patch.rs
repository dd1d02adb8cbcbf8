//! Sidecar patch generation
//!
//! Builds a JSON merge patch (RFC 7386) that appends one ephemeral container
//! to a pod. Merge patches replace arrays wholesale, so the generated patch
//! carries the complete `spec.ephemeralContainers` list: every existing entry
//! followed by the new one.
//!
//! The patch also carries the fetched pod's `metadata.resourceVersion`. The
//! API server treats it as a precondition: if any other writer touched the
//! pod since it was fetched, the patch is rejected with a conflict instead of
//! replacing the list and dropping the other writer's sidecar. Callers
//! re-fetch and regenerate on conflict.

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use serde_json::{Map, Value, json};

use crate::error::PatchError;
use crate::gateway::pod_name;
use crate::sidecar::SidecarDescriptor;

/// A generated patch and the pod it produces when applied.
#[derive(Debug, Clone)]
pub struct SidecarPatch {
    /// Serialized merge patch
    pub bytes: Vec<u8>,
    /// The patched pod as the API server will store it
    pub expected: Pod,
}

/// Generate the merge patch that adds `sidecar` to `pod`.
pub fn generate(pod: &Pod, sidecar: &SidecarDescriptor) -> Result<SidecarPatch, PatchError> {
    let name = pod_name(pod).to_string();

    let already_present = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.ephemeral_containers.as_ref())
        .is_some_and(|list| list.iter().any(|c| c.name == sidecar.name));
    if already_present {
        return Err(PatchError::Diff {
            pod: name,
            sidecar: sidecar.name.clone(),
        });
    }

    let original = serde_json::to_value(pod).map_err(|source| PatchError::Encoding {
        pod: name.clone(),
        source,
    })?;

    let mut expected = pod.clone();
    expected
        .spec
        .get_or_insert_with(PodSpec::default)
        .ephemeral_containers
        .get_or_insert_with(Vec::new)
        .push(sidecar.to_ephemeral_container());

    let modified = serde_json::to_value(&expected).map_err(|source| PatchError::Encoding {
        pod: name.clone(),
        source,
    })?;

    let Some(mut diff) = create_merge_patch(&original, &modified) else {
        return Err(PatchError::Diff {
            pod: name,
            sidecar: sidecar.name.clone(),
        });
    };

    if let (Some(version), Value::Object(map)) =
        (pod.metadata.resource_version.as_deref(), &mut diff)
    {
        map.insert("metadata".to_string(), json!({ "resourceVersion": version }));
    }

    let bytes = serde_json::to_vec(&diff).map_err(|source| PatchError::Encoding {
        pod: name,
        source,
    })?;

    Ok(SidecarPatch { bytes, expected })
}

/// Compute the merge patch turning `original` into `modified`.
///
/// Returns `None` when the documents are equal.
#[must_use]
pub fn create_merge_patch(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, new_value) in modi {
                match orig.get(key) {
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                    Some(old_value) => {
                        if let Some(nested) = create_merge_patch(old_value, new_value) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                }
            }
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (a, b) if a == b => None,
        (_, b) => Some(b.clone()),
    }
}

/// Apply a merge patch to `target` in place (RFC 7386).
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
