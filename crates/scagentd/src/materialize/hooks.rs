//! Post-hook runner: commands executed after a materialized write.

use std::time::Duration;

use sc_shared::ScError;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{info, warn};

const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    pub name: String,
    /// Whitespace-split into program + arguments.
    pub command: String,
}

/// Run hooks in order. A failing hook does not stop the remaining
/// hooks and never rolls back the write; all failures are aggregated
/// into one error.
pub async fn run_hooks(hooks: &[Hook]) -> Result<(), ScError> {
    let mut failures = Vec::new();
    for hook in hooks {
        match run_hook(hook, HOOK_TIMEOUT).await {
            Ok(()) => info!(hook = %hook.name, "post-hook succeeded"),
            Err(detail) => {
                warn!(hook = %hook.name, detail, "post-hook failed");
                failures.push(format!("{}: {detail}", hook.name));
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ScError::Hooks(failures.join("; ")))
    }
}

async fn run_hook(hook: &Hook, deadline: Duration) -> Result<(), String> {
    let mut words = hook.command.split_whitespace();
    let program = words.next().ok_or_else(|| "empty command".to_string())?;
    // kill_on_drop reaps the child when the deadline fires; the
    // dropped future must not leave it running.
    let result = timeout(
        deadline,
        tokio::process::Command::new(program)
            .args(words)
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match result {
        Ok(Ok(out)) if out.status.success() => Ok(()),
        Ok(Ok(out)) => Err(format!(
            "exit {:?}: {}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Ok(Err(e)) => Err(format!("spawn: {e}")),
        Err(_) => Err("timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str, command: &str) -> Hook {
        Hook {
            name: name.into(),
            command: command.into(),
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_despite_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let hooks = vec![
            hook("fails", "false"),
            hook("touches", &format!("touch {}", marker.display())),
        ];
        let result = run_hooks(&hooks).await;
        // Later hooks still ran.
        assert!(marker.exists());
        // The failure is still reported.
        match result {
            Err(ScError::Hooks(detail)) => assert!(detail.contains("fails")),
            other => panic!("expected hook failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_hooks_ok() {
        assert!(run_hooks(&[hook("a", "true"), hook("b", "true")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_command_is_a_failure() {
        assert!(run_hooks(&[hook("empty", "  ")]).await.is_err());
    }

    #[tokio::test]
    async fn test_hung_hook_times_out() {
        let err = run_hook(&hook("sleeper", "sleep 30"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, "timed out");
    }
}
