//! Lifecycle hook execution.
//!
//! Hooks run strictly one after another. Each hook receives the container
//! state document on stdin (embedded newlines flattened to spaces, followed
//! by a single newline and EOF); its stdout and stderr are consumed line by
//! line and logged. A positive `timeout` bounds the wait for that hook.

use crate::oci_spec::Hook;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::{process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    runtime::Builder,
};

/// Flatten the state document into the single line sent to a hook.
fn flatten_state(state: &str) -> String {
    let mut flat: String = state
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    flat.push('\n');
    flat
}

async fn log_lines<R>(reader: R, warn_level: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if warn_level {
            warn!("hook: {}", line);
        } else {
            info!("hook: {}", line);
        }
    }
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<i64>) -> Result<std::process::ExitStatus> {
    match timeout {
        Some(secs) if secs > 0 => {
            match tokio::time::timeout(Duration::from_secs(secs as u64), child.wait()).await {
                Ok(status) => status.context("wait for hook"),
                Err(_) => {
                    let _ = child.kill().await;
                    bail!("hook timed out after {} seconds", secs)
                }
            }
        }
        _ => child.wait().await.context("wait for hook"),
    }
}

/// Run a single hook to completion.
async fn run_hook(hook: &Hook, state: &str) -> Result<()> {
    // argv[0] may differ from the executed path so hooks can dispatch on
    // their own invocation name.
    let (arg0, rest) = match hook.args().as_deref() {
        Some([first, rest @ ..]) => (first.clone(), rest.to_vec()),
        _ => (hook.path().display().to_string(), Vec::new()),
    };

    let mut std_command = std::process::Command::new(hook.path());
    {
        use std::os::unix::process::CommandExt;
        std_command.arg0(&arg0);
    }
    std_command.args(&rest);

    if let Some(env) = hook.env() {
        std_command.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                std_command.env(key, value);
            }
        }
    }

    std_command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(
        "running hook command '{}' as '{}'",
        hook.path().display(),
        arg0
    );

    let mut child = Command::from(std_command)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn hook {}", hook.path().display()))?;

    let mut stdin = child.stdin.take().context("hook stdin not piped")?;
    let stdout = child.stdout.take().context("hook stdout not piped")?;
    let stderr = child.stderr.take().context("hook stderr not piped")?;

    stdin
        .write_all(flatten_state(state).as_bytes())
        .await
        .context("send container state to hook")?;
    // Dropping stdin delivers the EOF the hook waits for.
    drop(stdin);

    let (status, _, _) = tokio::join!(
        wait_with_timeout(&mut child, *hook.timeout()),
        log_lines(stdout, false),
        log_lines(stderr, true),
    );
    let status = status?;

    if !status.success() {
        bail!(
            "hook {} failed with {}",
            hook.path().display(),
            status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "a signal".into())
        );
    }

    debug!("hook {} finished successfully", hook.path().display());
    Ok(())
}

/// Run a group of hooks sequentially.
///
/// With `stop_on_failure` the first failing hook aborts the group;
/// otherwise failures are logged and the remaining hooks still run, with
/// the first error reported at the end.
pub fn run_hooks(hooks: &[Hook], state: &str, stop_on_failure: bool) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build hook runtime")?;

    let mut first_error = None;

    for hook in hooks {
        if let Err(e) = runtime.block_on(run_hook(hook, state)) {
            if stop_on_failure {
                return Err(e);
            }
            warn!("{}", crate::error::chain(e.context("hook failed")));
            if first_error.is_none() {
                first_error = Some(anyhow::anyhow!("at least one hook failed"));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_spec::HookBuilder;
    use std::fs;
    use tempfile::TempDir;

    fn shell_hook(script: &str) -> Hook {
        HookBuilder::default()
            .path("/bin/sh")
            .args(vec!["sh".to_string(), "-c".into(), script.into()])
            .build()
            .expect("hook")
    }

    #[test]
    fn no_hooks_is_a_noop() -> Result<()> {
        run_hooks(&[], "{}", true)
    }

    #[test]
    fn hook_receives_flattened_state() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("state.out");
        let hook = shell_hook(&format!("cat > {}", out.display()));

        run_hooks(&[hook], "{\n  \"id\": \"x\"\n}", true)?;

        assert_eq!(fs::read_to_string(&out)?, "{   \"id\": \"x\" }\n");
        Ok(())
    }

    #[test]
    fn failing_hook_aborts_when_stopping_on_failure() -> Result<()> {
        let hooks = vec![shell_hook("exit 1"), shell_hook("exit 0")];
        assert!(run_hooks(&hooks, "{}", true).is_err());
        Ok(())
    }

    #[test]
    fn failing_hook_continues_otherwise() -> Result<()> {
        let dir = TempDir::new()?;
        let marker = dir.path().join("ran");
        let hooks = vec![
            shell_hook("exit 1"),
            shell_hook(&format!("touch {}", marker.display())),
        ];

        // The error is still reported, but the second hook must have run.
        assert!(run_hooks(&hooks, "{}", false).is_err());
        assert!(marker.exists());
        Ok(())
    }

    #[test]
    fn hook_with_custom_argv0() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("argv0.out");
        // $0 is the invocation name the hook sees.
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "netns-helper".to_string(),
                "-c".into(),
                format!("echo $0 > {}", out.display()),
            ])
            .build()?;

        run_hooks(&[hook], "{}", true)?;
        assert_eq!(fs::read_to_string(&out)?.trim(), "netns-helper");
        Ok(())
    }

    #[test]
    fn hook_environment_is_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("env.out");
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec![
                "sh".to_string(),
                "-c".into(),
                format!("echo \"$HOOK_MARK\" > {}", out.display()),
            ])
            .env(vec![
                "HOOK_MARK=present".to_string(),
                "PATH=/usr/bin:/bin".into(),
            ])
            .build()?;

        run_hooks(&[hook], "{}", true)?;
        assert_eq!(fs::read_to_string(&out)?.trim(), "present");
        Ok(())
    }

    #[test]
    fn hook_timeout_enforced() -> Result<()> {
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec!["sh".to_string(), "-c".into(), "sleep 10".into()])
            .timeout(1)
            .build()?;

        let err = run_hooks(&[hook], "{}", true).expect_err("timeout");
        assert!(crate::error::chain(err).contains("timed out"));
        Ok(())
    }

    #[test]
    fn missing_hook_binary() -> Result<()> {
        let hook = HookBuilder::default().path("/nonexistent/hook").build()?;
        assert!(run_hooks(&[hook], "{}", true).is_err());
        Ok(())
    }
}
