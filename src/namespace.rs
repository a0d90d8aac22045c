//! OCI namespace handling.
//!
//! This runtime does not build namespaced host processes, but the network
//! namespace matters: the container engine sets up networking inside it and
//! the runtime joins it so discovery and tap plumbing happen in the right
//! place. All other namespace requests are recorded and left inert.

use crate::oci_spec::LinuxNamespace;
use anyhow::{Context, Result};
use log::debug;
use nix::{
    fcntl::{open, OFlag},
    sched::{setns, unshare, CloneFlags},
    sys::stat::Mode,
    unistd::close,
};
use std::path::PathBuf;
use strum::{Display, EnumString};

/// The namespace types of the OCI runtime specification.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum NamespaceType {
    Cgroup,
    Ipc,
    Mount,
    Network,
    Pid,
    User,
    Uts,
}

impl NamespaceType {
    fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::Network => CloneFlags::CLONE_NEWNET,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        }
    }
}

/// A parsed namespace request.
#[derive(Clone, Debug, PartialEq)]
pub struct Namespace {
    /// Namespace type.
    pub typ: NamespaceType,

    /// Existing namespace to join, if any.
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// Parse the OCI form, rejecting unknown types.
    pub fn from_oci(ns: &LinuxNamespace) -> Result<Self> {
        let typ = ns
            .typ()
            .parse::<NamespaceType>()
            .with_context(|| format!("unknown namespace type {}", ns.typ()))?;
        Ok(Self {
            typ,
            path: ns.path().clone(),
        })
    }
}

/// Parse all namespace requests from the OCI configuration.
pub fn from_spec(namespaces: &[LinuxNamespace]) -> Result<Vec<Namespace>> {
    namespaces.iter().map(Namespace::from_oci).collect()
}

/// Join or create the requested network namespace.
///
/// Runs in the parent before the hypervisor fork so both the prestart hooks
/// and the forked child see the same namespace. Non-network requests are
/// skipped.
pub fn setup(namespaces: &[Namespace]) -> Result<()> {
    if namespaces.is_empty() {
        debug!("no namespaces to setup");
        return Ok(());
    }

    for ns in namespaces {
        if ns.typ != NamespaceType::Network {
            debug!("ignoring {} namespace request", ns.typ);
            continue;
        }

        match &ns.path {
            Some(path) => {
                let fd = open(path.as_path(), OFlag::O_RDONLY, Mode::empty())
                    .with_context(|| format!("open namespace path {}", path.display()))?;
                let res = setns(fd, ns.typ.clone_flag())
                    .with_context(|| format!("join {} namespace {}", ns.typ, path.display()));
                let _ = close(fd);
                res?;
                debug!("joined {} namespace {}", ns.typ, path.display());
            }
            None => {
                unshare(ns.typ.clone_flag())
                    .with_context(|| format!("create {} namespace", ns.typ))?;
                debug!("created {} namespace", ns.typ);
            }
        }
    }

    debug!("finished namespace setup");
    Ok(())
}
