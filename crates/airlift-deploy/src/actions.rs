//! Action runner
//!
//! Lifecycle actions are single shell commands with a working directory,
//! extra environment, a per-attempt timeout and a retry budget. The trimmed
//! stdout of the first successful attempt feeds `set_variables`, making the
//! value visible to every later action, manifest, chart and file in the
//! deploy.

use airlift_core::{Action, VariableState};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};

/// Output of one successful action
#[derive(Debug, Clone)]
pub struct ActionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Pick the shell for an action on this platform.
fn shell_for(action: &Action) -> (String, &'static str) {
    let pinned = action.shell.as_ref().and_then(|s| {
        if cfg!(windows) {
            s.windows.clone()
        } else if cfg!(target_os = "macos") {
            s.darwin.clone()
        } else {
            s.linux.clone()
        }
    });
    match pinned {
        Some(shell) => {
            let flag = if shell.contains("powershell") || shell.contains("pwsh") {
                "-Command"
            } else {
                "-c"
            };
            (shell, flag)
        }
        None if cfg!(windows) => ("powershell".to_string(), "-Command"),
        None => ("sh".to_string(), "-c"),
    }
}

/// Run one action to completion, honoring retries and the per-attempt
/// timeout, then propagate captured stdout into `set_variables`.
pub async fn run_action(
    action: &Action,
    default_dir: &Path,
    variables: &Arc<Mutex<VariableState>>,
) -> Result<ActionOutput> {
    // The command line itself may reference variables set by earlier
    // actions.
    let cmd = {
        let vars = variables.lock().await;
        vars.expand(&action.cmd, "action cmd")?
    };

    if let Some(description) = &action.description {
        info!(action = %description, "running action");
    } else {
        info!(cmd = %cmd, "running action");
    }

    let attempts = action.max_retries + 1;
    let mut last_error: Option<DeployError> = None;

    for attempt in 1..=attempts {
        match run_once(action, &cmd, default_dir, variables).await {
            Ok(output) => {
                if !action.mute {
                    if !output.stdout.is_empty() {
                        debug!(stdout = %output.stdout.trim_end(), "action stdout");
                    }
                    if !output.stderr.is_empty() {
                        debug!(stderr = %output.stderr.trim_end(), "action stderr");
                    }
                }

                if !action.set_variables.is_empty() {
                    let value = output.stdout.trim().to_string();
                    let mut vars = variables.lock().await;
                    for set in &action.set_variables {
                        debug!(variable = %set.name, "captured action output");
                        vars.set(&set.name, value.clone(), set.sensitive);
                    }
                }
                return Ok(output);
            }
            Err(e) => {
                warn!(cmd = %cmd, attempt, error = %e, "action attempt failed");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
            }
        }
    }

    let last = last_error.expect("attempts >= 1");
    // Timeouts keep their own error shape for the user.
    if matches!(last, DeployError::ActionTimeout { .. }) {
        return Err(last);
    }
    Err(DeployError::ActionFailed {
        cmd,
        attempts,
        message: last.to_string(),
    })
}

async fn run_once(
    action: &Action,
    cmd: &str,
    default_dir: &Path,
    variables: &Arc<Mutex<VariableState>>,
) -> Result<ActionOutput> {
    let (shell, flag) = shell_for(action);
    let mut command = tokio::process::Command::new(&shell);
    command
        .arg(flag)
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    match &action.dir {
        Some(dir) => command.current_dir(dir),
        None => command.current_dir(default_dir),
    };

    for entry in &action.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    // Resolved variables are always exported for the command to read.
    {
        let vars = variables.lock().await;
        for (key, value) in vars.action_env() {
            command.env(key, value);
        }
    }

    let wait = command.output();
    let output = if action.max_total_seconds > 0 {
        match tokio::time::timeout(Duration::from_secs(action.max_total_seconds), wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeployError::ActionTimeout {
                    cmd: cmd.to_string(),
                    seconds: action.max_total_seconds,
                })
            }
        }
    } else {
        wait.await?
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(DeployError::ActionFailed {
            cmd: cmd.to_string(),
            attempts: 1,
            message: if stderr.trim().is_empty() {
                format!("exit status {}", output.status)
            } else {
                stderr.trim().to_string()
            },
        });
    }
    Ok(ActionOutput { stdout, stderr })
}

/// Run an action list in order, stopping on the first failure.
pub async fn run_all(
    actions: &[Action],
    default_dir: &Path,
    variables: &Arc<Mutex<VariableState>>,
) -> Result<()> {
    for action in actions {
        run_action(action, default_dir, variables).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::{Bundle, SetVariable};
    use std::collections::HashMap;

    fn variables() -> Arc<Mutex<VariableState>> {
        let bundle = Bundle::parse("kind: AppConfig\nmetadata:\n  name: t\n").unwrap();
        Arc::new(Mutex::new(
            VariableState::new(&bundle, &HashMap::new()).unwrap(),
        ))
    }

    fn echo_action(cmd: &str) -> Action {
        Action {
            cmd: cmd.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let vars = variables();
        let output = run_action(&echo_action("echo hello"), Path::new("."), &vars)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn set_variable_visible_to_next_action() {
        let vars = variables();
        let mut first = echo_action("echo 1.2.3");
        first.set_variables = vec![SetVariable {
            name: "VERSION".to_string(),
            sensitive: false,
        }];
        run_action(&first, Path::new("."), &vars).await.unwrap();

        // Both through placeholder expansion of the command line and the
        // exported environment.
        let second = echo_action("echo ###AIRLIFT_VAR_VERSION###-$AIRLIFT_VAR_VERSION");
        let output = run_action(&second, Path::new("."), &vars).await.unwrap();
        assert_eq!(output.stdout.trim(), "1.2.3-1.2.3");
    }

    #[tokio::test]
    async fn failing_action_retries_then_errors() {
        let vars = variables();
        let mut action = echo_action("false");
        action.max_retries = 1;
        let err = run_action(&action, Path::new("."), &vars).await.unwrap_err();
        assert!(matches!(err, DeployError::ActionFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let vars = variables();
        let mut action = echo_action("sleep 5");
        action.max_total_seconds = 1;
        let err = run_action(&action, Path::new("."), &vars).await.unwrap_err();
        assert!(matches!(err, DeployError::ActionTimeout { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn working_directory_respected() {
        let temp = tempfile::TempDir::new().unwrap();
        let vars = variables();
        let mut action = echo_action("pwd");
        action.dir = Some(temp.path().display().to_string());
        let output = run_action(&action, Path::new("."), &vars).await.unwrap();
        assert!(output.stdout.trim().ends_with(
            temp.path().file_name().unwrap().to_str().unwrap()
        ));
    }

    #[tokio::test]
    async fn extra_env_passed_through() {
        let vars = variables();
        let mut action = echo_action("echo $GREETING");
        action.env = vec!["GREETING=hi".to_string()];
        let output = run_action(&action, Path::new("."), &vars).await.unwrap();
        assert_eq!(output.stdout.trim(), "hi");
    }
}
