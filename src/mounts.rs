//! Host-side mount handling.
//!
//! Mounts from the OCI configuration are applied below the container rootfs
//! (or the pod's shared workloads directory) before the VM starts. Standard
//! pseudo-filesystems are skipped since the guest provides them itself.
//! Every applied mount is recorded in the state document so cleanup can undo
//! it and remove any directories created along the way.

use crate::{
    config::{ContainerConfig, DIR_MODE},
    oci_spec::Mount,
    state::{StateMount, StateMountBuilder},
};
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use nix::mount::{mount, umount, MsFlags};
use rand::RngCore;
use std::{
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

lazy_static! {
    /// Mounts that are created inside the VM automatically and therefore
    /// never applied on the host. Matched against source, destination and
    /// filesystem type.
    static ref IGNORED_MOUNTS: Vec<&'static str> = vec![
        "/proc",
        "/dev",
        "/dev/pts",
        "/dev/shm",
        "/dev/mqueue",
        "/sys",
        "/sys/fs/cgroup",
    ];
}

/// One mount ready to be applied.
#[derive(Clone, Debug)]
pub struct MountEntry {
    /// Mount source (device, directory or file).
    pub source: PathBuf,

    /// Guest-relative destination from the OCI configuration.
    pub mount_dir: PathBuf,

    /// Filesystem type.
    pub typ: String,

    /// Parsed mount flags.
    pub flags: MsFlags,

    /// Remaining comma-joined data options.
    pub data: String,

    /// Skip this mount, the guest provides it.
    pub ignore: bool,

    /// Computed host destination.
    pub dest: PathBuf,

    /// First directory created to be able to mount `dest`.
    pub directory_created: Option<PathBuf>,

    /// Randomized name below the shared workloads directory (volumes only).
    pub host_path: Option<String>,
}

impl Default for MountEntry {
    fn default() -> Self {
        MountEntry {
            source: PathBuf::default(),
            mount_dir: PathBuf::default(),
            typ: String::default(),
            flags: MsFlags::empty(),
            data: String::default(),
            ignore: bool::default(),
            dest: PathBuf::default(),
            directory_created: None,
            host_path: None,
        }
    }
}

/// Map an fstab-style option to its mount flag, if it is one.
fn option_flag(option: &str) -> Option<MsFlags> {
    Some(match option {
        "bind" => MsFlags::MS_BIND,
        "rbind" => MsFlags::MS_BIND | MsFlags::MS_REC,
        "ro" => MsFlags::MS_RDONLY,
        "nosuid" => MsFlags::MS_NOSUID,
        "nodev" => MsFlags::MS_NODEV,
        "noexec" => MsFlags::MS_NOEXEC,
        "sync" => MsFlags::MS_SYNCHRONOUS,
        "dirsync" => MsFlags::MS_DIRSYNC,
        "remount" => MsFlags::MS_REMOUNT,
        "mand" => MsFlags::MS_MANDLOCK,
        "noatime" => MsFlags::MS_NOATIME,
        "nodiratime" => MsFlags::MS_NODIRATIME,
        "relatime" => MsFlags::MS_RELATIME,
        "strictatime" => MsFlags::MS_STRICTATIME,
        "shared" => MsFlags::MS_SHARED,
        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE,
        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "private" => MsFlags::MS_PRIVATE,
        "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "runbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        _ => return None,
    })
}

impl MountEntry {
    /// Build an entry from its OCI form, splitting options into flags and
    /// data and marking ignored mounts.
    pub fn from_oci(mount: &Mount) -> Self {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();

        for option in mount.options().iter().flatten() {
            match option_flag(option) {
                Some(flag) => flags |= flag,
                // "rw" is the absence of MS_RDONLY.
                None if option == "rw" => {}
                None => data.push(option.clone()),
            }
        }

        let source = mount.source().clone().unwrap_or_default();
        let typ = mount.typ().clone().unwrap_or_default();

        let mut entry = Self {
            source,
            mount_dir: mount.destination().clone(),
            typ,
            flags,
            data: data.join(","),
            ..Default::default()
        };
        entry.ignore = entry.should_ignore();
        entry
    }

    fn should_ignore(&self) -> bool {
        IGNORED_MOUNTS.iter().any(|&ignored| {
            self.source == Path::new(ignored)
                || self.mount_dir == Path::new(ignored)
                || self.typ == ignored.trim_start_matches('/')
        })
    }

    fn to_state(&self) -> StateMount {
        let mut builder = StateMountBuilder::default()
            .destination(self.dest.clone())
            .mount_dir(self.mount_dir.clone());
        if let Some(created) = &self.directory_created {
            builder = builder.directory_created(created.clone());
        }
        if let Some(host_path) = &self.host_path {
            builder = builder.host_path(host_path.clone());
        }
        builder.build().unwrap_or_default()
    }
}

/// Find the first path component that would have to be created for `dir` to
/// exist.
fn first_missing_parent(dir: &Path) -> Option<PathBuf> {
    if dir.exists() {
        return None;
    }

    let mut missing = dir.to_path_buf();
    while let Some(parent) = missing.parent() {
        if parent.exists() || parent == Path::new("/") || parent == Path::new("") {
            return Some(missing);
        }
        missing = parent.to_path_buf();
    }
    Some(missing)
}

/// Perform a single mount. In dry-run mode only log what would happen.
fn perform_mount(entry: &MountEntry, dry_run: bool) -> Result<()> {
    debug!(
        "{}mount {} of type {} onto {} with data '{}' and flags {:?}{}",
        if dry_run { "not " } else { "" },
        entry.source.display(),
        entry.typ,
        entry.dest.display(),
        entry.data,
        entry.flags,
        if dry_run { " (dry-run mode)" } else { "" },
    );

    if dry_run {
        return Ok(());
    }

    // Bind-mounting a regular file needs an existing file as target.
    // Pseudo-filesystem sources ("tmpfs", "proc") are not paths.
    if entry.source.is_file() && !entry.dest.exists() {
        fs::File::create(&entry.dest)
            .with_context(|| format!("create mount target file {}", entry.dest.display()))?;
    }

    mount(
        Some(entry.source.as_path()),
        entry.dest.as_path(),
        if entry.typ.is_empty() {
            None
        } else {
            Some(entry.typ.as_str())
        },
        entry.flags,
        if entry.data.is_empty() {
            None
        } else {
            Some(entry.data.as_str())
        },
    )
    .with_context(|| {
        format!(
            "mount {} onto {}",
            entry.source.display(),
            entry.dest.display()
        )
    })
}

/// Compute destinations and apply the provided mounts below `workload_dir`.
///
/// With `volume` set, each mount lands below the shared workloads directory
/// under a randomized unique name the guest agent maps into the container.
pub fn handle_mounts(
    config: &ContainerConfig,
    mounts: &[MountEntry],
    workload_dir: &Path,
    volume: bool,
) -> Result<Vec<StateMount>> {
    let mut applied = Vec::new();

    for entry in mounts {
        if entry.ignore {
            debug!("ignoring mount {}", entry.mount_dir.display());
            continue;
        }
        // An absolute source that is gone is not fatal; the engine may
        // have raced a container teardown.
        if entry.source.is_absolute() && !entry.source.exists() {
            debug!(
                "ignoring mount, {} does not exist",
                entry.source.display()
            );
            continue;
        }
        let mut entry = entry.clone();

        if volume {
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            let base = entry
                .mount_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let host_path = format!("{:x}-{}", u64::from_be_bytes(bytes), base);

            entry.dest = workload_dir.join(&host_path);
            entry.host_path = Some(host_path);
        } else {
            let relative = entry
                .mount_dir
                .strip_prefix("/")
                .unwrap_or(&entry.mount_dir);
            entry.dest = workload_dir.join(relative);
        }

        // A regular-file source is mounted over a file, so only its parent
        // directory is created.
        let dir_target = if entry.source.is_file() {
            entry
                .dest
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| entry.dest.clone())
        } else {
            entry.dest.clone()
        };

        entry.directory_created = first_missing_parent(&dir_target);

        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&dir_target)
            .with_context(|| format!("create mount directory {}", dir_target.display()))?;

        perform_mount(&entry, config.dry_run())?;
        applied.push(entry.to_state());
    }

    Ok(applied)
}

/// Build the entry list for the mounts of the OCI configuration.
pub fn from_spec(config: &ContainerConfig) -> Vec<MountEntry> {
    config
        .spec()
        .as_ref()
        .and_then(|s| s.mounts().clone())
        .unwrap_or_default()
        .iter()
        .map(MountEntry::from_oci)
        .collect()
}

/// The rootfs bind mount placing a pod member's root filesystem below the
/// sandbox's shared workloads directory.
pub fn rootfs_bind_mount(config: &ContainerConfig) -> Result<MountEntry> {
    let rootfs = config.rootfs_path()?;

    Ok(MountEntry {
        source: rootfs,
        mount_dir: PathBuf::from(format!("/{}/rootfs", config.container_id())),
        typ: "bind".into(),
        flags: MsFlags::MS_BIND,
        ..Default::default()
    })
}

/// Undo all recorded mounts and remove the directories created for them.
///
/// Targets that are already gone or no longer mounted are not an error, so
/// cleanup stays repeatable.
pub fn unmount_all(mounts: &[StateMount], dry_run: bool) -> Result<()> {
    for state_mount in mounts {
        let dest = state_mount.destination();

        if dry_run {
            debug!("not unmounting {} (dry-run mode)", dest.display());
        } else if let Err(e) = umount(dest.as_path()) {
            match e {
                nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT => {
                    debug!("{} is not mounted", dest.display())
                }
                other => warn!("failed to unmount {}: {}", dest.display(), other),
            }
        }

        if let Some(created) = state_mount.directory_created() {
            match fs::remove_dir_all(created) {
                Ok(()) => debug!("removed created mount directory {}", created.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "failed to remove created mount directory {}: {}",
                    created.display(),
                    e
                ),
            }
        }
    }

    Ok(())
}
