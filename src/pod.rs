//! Pod grouping.
//!
//! Container engines that schedule pods mark their members with annotations
//! in the `ocid/` namespace. A sandbox owns the VM and a shared `workloads`
//! directory; member containers attach to the sandbox's proxy session and
//! bind-mount their rootfs below the shared tree.

use anyhow::{bail, Context, Result};
use getset::{CopyGetters, Getters};
use log::debug;
use std::{
    collections::HashMap,
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

/// Annotation namespace prefix handled here.
pub const ANNOTATION_NAMESPACE: &str = "ocid/";

/// Annotation naming the container's role inside a pod.
pub const ANNOTATION_CONTAINER_TYPE: &str = "ocid/container_type";

/// Annotation value marking the sandbox container.
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";

/// Annotation value marking a pod member container.
pub const CONTAINER_TYPE_CONTAINER: &str = "container";

/// Annotation naming the sandbox a member belongs to.
pub const ANNOTATION_SANDBOX_NAME: &str = "ocid/sandbox_name";

/// Directory below the sandbox runtime directory holding member rootfs
/// mounts.
pub const SANDBOX_ROOTFS_DIR: &str = "workloads";

#[derive(Clone, Debug, Default, PartialEq, Getters, CopyGetters)]
/// Pod grouping details for one container.
pub struct Pod {
    #[getset(get_copy = "pub")]
    /// Whether this container is the pod sandbox.
    sandbox: bool,

    #[getset(get = "pub")]
    /// Name of the sandbox this container belongs to.
    sandbox_name: String,

    #[getset(get = "pub")]
    /// Shared directory holding the pod members' root filesystems.
    sandbox_workloads: PathBuf,
}

impl Pod {
    /// Inspect the OCI annotations for pod-grouping keys.
    ///
    /// Returns `None` when the container is not part of a pod. For a sandbox
    /// the shared workloads directory is created as a side effect.
    pub fn from_annotations(
        container_id: &str,
        root_dir: &Path,
        annotations: HashMap<String, String>,
    ) -> Result<Option<Self>> {
        if !annotations
            .keys()
            .any(|k| k.starts_with(ANNOTATION_NAMESPACE))
        {
            return Ok(None);
        }

        let container_type = annotations
            .get(ANNOTATION_CONTAINER_TYPE)
            .map(String::as_str);
        let named_sandbox = annotations.get(ANNOTATION_SANDBOX_NAME).cloned();

        let pod = match container_type {
            Some(CONTAINER_TYPE_SANDBOX) => {
                let sandbox_name = named_sandbox.unwrap_or_else(|| container_id.to_string());
                let sandbox_workloads =
                    root_dir.join(&sandbox_name).join(SANDBOX_ROOTFS_DIR);

                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(crate::config::DIR_MODE)
                    .create(&sandbox_workloads)
                    .with_context(|| {
                        format!("create directory {}", sandbox_workloads.display())
                    })?;

                debug!(
                    "container {} is a pod sandbox (workloads {})",
                    container_id,
                    sandbox_workloads.display()
                );

                Self {
                    sandbox: true,
                    sandbox_name,
                    sandbox_workloads,
                }
            }
            Some(CONTAINER_TYPE_CONTAINER) => {
                let sandbox_name = named_sandbox.with_context(|| {
                    format!(
                        "pod member {} carries no {} annotation",
                        container_id, ANNOTATION_SANDBOX_NAME
                    )
                })?;
                let sandbox_workloads =
                    root_dir.join(&sandbox_name).join(SANDBOX_ROOTFS_DIR);

                debug!(
                    "container {} is a member of pod {}",
                    container_id, sandbox_name
                );

                Self {
                    sandbox: false,
                    sandbox_name,
                    sandbox_workloads,
                }
            }
            Some(other) => bail!(
                "unknown {} annotation value: {}",
                ANNOTATION_CONTAINER_TYPE,
                other
            ),
            // Other ocid/ annotations without a container type are passed
            // through untouched.
            None => return Ok(None),
        };

        Ok(Some(pod))
    }

    /// Rootfs location of a pod member below the shared workloads tree.
    pub fn member_rootfs(&self, container_id: &str) -> PathBuf {
        self.sandbox_workloads
            .join(container_id)
            .join("rootfs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn annotations(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_pod_annotations() -> Result<()> {
        let dir = TempDir::new()?;
        let pod = Pod::from_annotations(
            "c1",
            dir.path(),
            annotations(&[("io.kubernetes.cri-o.TTY", "true")]),
        )?;
        assert!(pod.is_none());
        Ok(())
    }

    #[test]
    fn sandbox_creates_workloads_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let pod = Pod::from_annotations(
            "sandbox-1",
            dir.path(),
            annotations(&[(ANNOTATION_CONTAINER_TYPE, CONTAINER_TYPE_SANDBOX)]),
        )?
        .expect("pod");

        assert!(pod.sandbox());
        assert_eq!(pod.sandbox_name(), "sandbox-1");
        assert!(pod.sandbox_workloads().is_dir());
        assert_eq!(
            pod.sandbox_workloads(),
            &dir.path().join("sandbox-1").join(SANDBOX_ROOTFS_DIR)
        );
        Ok(())
    }

    #[test]
    fn sandbox_name_annotation_wins() -> Result<()> {
        let dir = TempDir::new()?;
        let pod = Pod::from_annotations(
            "sandbox-1",
            dir.path(),
            annotations(&[
                (ANNOTATION_CONTAINER_TYPE, CONTAINER_TYPE_SANDBOX),
                (ANNOTATION_SANDBOX_NAME, "frontend"),
            ]),
        )?
        .expect("pod");

        assert_eq!(pod.sandbox_name(), "frontend");
        Ok(())
    }

    #[test]
    fn member_requires_sandbox_name() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(Pod::from_annotations(
            "member-1",
            dir.path(),
            annotations(&[(ANNOTATION_CONTAINER_TYPE, CONTAINER_TYPE_CONTAINER)]),
        )
        .is_err());

        let pod = Pod::from_annotations(
            "member-1",
            dir.path(),
            annotations(&[
                (ANNOTATION_CONTAINER_TYPE, CONTAINER_TYPE_CONTAINER),
                (ANNOTATION_SANDBOX_NAME, "sandbox-1"),
            ]),
        )?
        .expect("pod");

        assert!(!pod.sandbox());
        assert_eq!(
            pod.member_rootfs("member-1"),
            dir.path()
                .join("sandbox-1")
                .join(SANDBOX_ROOTFS_DIR)
                .join("member-1")
                .join("rootfs")
        );
        Ok(())
    }

    #[test]
    fn unknown_container_type_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(Pod::from_annotations(
            "c1",
            dir.path(),
            annotations(&[(ANNOTATION_CONTAINER_TYPE, "something-else")]),
        )
        .is_err());
        Ok(())
    }
}
