//! Emission of the in-guest workload files.
//!
//! The guest boots a service that executes a well-known script below the
//! container rootfs. `create` renders the OCI process configuration into
//! that script plus an adjacent environment file.

use crate::config::{ContainerConfig, ENV_FILE, SCRIPT_MODE, WORKLOAD_FILE, WORKLOAD_SHELL};
use anyhow::{Context, Result};
use log::debug;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Passwd file below the rootfs used to derive HOME.
const PASSWD_PATH: &str = "etc/passwd";

/// Stateless fallback passwd location.
const STATELESS_PASSWD_PATH: &str = "usr/share/defaults/etc/passwd";

/// Quote a string for POSIX shell consumption.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Look up the home directory for `uid` in a passwd formatted file.
fn user_home_dir(passwd: &Path, uid: u32) -> Option<String> {
    let contents = fs::read_to_string(passwd).ok()?;
    for line in contents.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        // name:passwd:uid:gid:gecos:dir:shell
        if fields.len() < 6 {
            continue;
        }
        if fields[2].parse::<u32>().ok() == Some(uid) {
            return Some(fields[5].to_string());
        }
    }
    None
}

/// Ensure the environment carries a HOME entry, deriving one from the
/// workload user when absent.
pub fn env_with_home(rootfs: &Path, uid: u32, env: Vec<String>) -> Vec<String> {
    if env.iter().any(|e| e.starts_with("HOME=")) {
        debug!("HOME already present in the configured environment");
        return env;
    }

    let home = user_home_dir(&rootfs.join(PASSWD_PATH), uid)
        .or_else(|| user_home_dir(&rootfs.join(STATELESS_PASSWD_PATH), uid))
        .unwrap_or_else(|| {
            debug!("no passwd entry for uid {}, defaulting HOME to /", uid);
            "/".to_string()
        });

    let mut out = Vec::with_capacity(env.len() + 1);
    out.push(format!("HOME={}", home));
    out.extend(env);
    out
}

/// Write the workload script and environment file into the rootfs and record
/// the script path in the VM configuration.
pub fn create_workload(config: &mut ContainerConfig) -> Result<()> {
    let rootfs = config.rootfs_path()?;

    let process = config
        .spec()
        .as_ref()
        .and_then(|s| s.process().clone())
        .context("no process in OCI configuration")?;

    let args = process
        .args()
        .clone()
        .filter(|a| !a.is_empty())
        .context("no workload arguments")?;

    if let Some(env) = process.env() {
        let env = env_with_home(&rootfs, process.user().uid(), env.clone());
        let env_path = rootfs.join(ENV_FILE);
        fs::write(&env_path, env.join("\n"))
            .with_context(|| format!("create environment file {}", env_path.display()))?;
    }

    let path = rootfs.join(WORKLOAD_FILE);
    let cwd = shell_quote(process.cwd());
    let cmdline = args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");

    let contents = format!("#!{}\ncd {}\n{}\n", WORKLOAD_SHELL, cwd, cmdline);
    fs::write(&path, contents)
        .with_context(|| format!("create workload file {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(SCRIPT_MODE))
        .with_context(|| format!("set mode for workload file {}", path.display()))?;

    debug!("created workload script {}", path.display());

    if let Some(vm) = config.vm_mut() {
        vm.set_workload_path(path);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ContainerConfigBuilder,
        oci_spec::{ProcessBuilder, RootBuilder, SpecBuilder, UserBuilder},
    };
    use tempfile::TempDir;

    #[test]
    fn quote_simple_strings_untouched() {
        assert_eq!(shell_quote("/bin/true"), "/bin/true");
        assert_eq!(shell_quote("abc-1.2_3"), "abc-1.2_3");
    }

    #[test]
    fn quote_special_characters() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn home_from_passwd() -> Result<()> {
        let dir = TempDir::new()?;
        let etc = dir.path().join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(
            etc.join("passwd"),
            "root:x:0:0:root:/root:/bin/sh\nuser:x:1000:1000::/home/user:/bin/sh\n",
        )?;

        let env = env_with_home(dir.path(), 1000, vec!["PATH=/bin".into()]);
        assert_eq!(env[0], "HOME=/home/user");
        assert_eq!(env[1], "PATH=/bin");
        Ok(())
    }

    #[test]
    fn home_not_duplicated() -> Result<()> {
        let dir = TempDir::new()?;
        let env = env_with_home(dir.path(), 0, vec!["HOME=/already".into()]);
        assert_eq!(env, vec!["HOME=/already".to_string()]);
        Ok(())
    }

    #[test]
    fn home_defaults_to_root_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let env = env_with_home(dir.path(), 42, vec![]);
        assert_eq!(env, vec!["HOME=/".to_string()]);
        Ok(())
    }

    fn workload_config(dir: &TempDir) -> Result<ContainerConfigBuilder> {
        fs::create_dir_all(dir.path().join("rootfs"))?;

        let spec = SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .args(vec!["echo".to_string(), "hello world".into()])
                    .env(vec!["PATH=/bin".to_string()])
                    .cwd("/work dir")
                    .user(UserBuilder::default().uid(0u32).build()?)
                    .build()?,
            )
            .root(RootBuilder::default().path("rootfs").build()?)
            .build()?;

        Ok(ContainerConfigBuilder::default()
            .container_id("w1")
            .bundle_path(dir.path().to_path_buf())
            .root_dir(dir.path().to_path_buf())
            .spec(spec)
            .vm(crate::config::VmConfigBuilder::default().build()?))
    }

    #[test]
    fn script_and_env_emitted() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = workload_config(&dir)?.build()?;

        create_workload(&mut config)?;

        let rootfs = dir.path().join("rootfs");
        let script = fs::read_to_string(rootfs.join(WORKLOAD_FILE))?;
        assert_eq!(script, "#!/bin/sh\ncd '/work dir'\necho 'hello world'\n");

        let mode = fs::metadata(rootfs.join(WORKLOAD_FILE))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let env = fs::read_to_string(rootfs.join(ENV_FILE))?;
        assert!(env.starts_with("HOME="));
        assert!(env.contains("PATH=/bin"));

        assert_eq!(
            config.vm().as_ref().expect("vm").workload_path(),
            &rootfs.join(WORKLOAD_FILE)
        );
        Ok(())
    }

    #[test]
    fn missing_args_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("rootfs"))?;

        let spec = SpecBuilder::default()
            .process(ProcessBuilder::default().cwd("/").build()?)
            .root(RootBuilder::default().path("rootfs").build()?)
            .build()?;

        let mut config = ContainerConfigBuilder::default()
            .container_id("w2")
            .bundle_path(dir.path().to_path_buf())
            .root_dir(dir.path().to_path_buf())
            .spec(spec)
            .build()?;

        assert!(create_workload(&mut config).is_err());
        Ok(())
    }
}
