//! An OCI-compatible container runtime that executes each container inside
//! a lightweight virtual machine.

pub mod cli;
pub mod config;
pub mod error;
pub mod hooks;
pub mod hypervisor;
pub mod launch;
pub mod lifecycle;
pub mod logging;
pub mod mounts;
pub mod namespace;
pub mod network;
pub mod oci_spec;
pub mod pod;
pub mod protocol;
pub mod proxy;
pub mod semver;
pub mod shim;
pub mod state;
pub mod workload;
