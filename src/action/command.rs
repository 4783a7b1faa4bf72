// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! command.rs
//!
//! Building command lines from templates and running them on the local host.

use std::{collections::HashMap, io, process::Stdio, time::Duration};

use tokio::process::Command;

use super::ActionError;

/// Replace every `{name}` placeholder in `template` with its value from `vars`.
///
/// An unknown placeholder is an error rather than being left in place, since running a command
/// with a literal `{devcie}` in it would fail in a much less obvious way.
pub fn substitute(template: &str, vars: &HashMap<&str, String>) -> Result<String, ActionError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(ActionError::User(format!(
                "unterminated placeholder in command template '{template}'"
            )));
        };
        let name = &after[..close];
        match vars.get(name) {
            Some(value) => output.push_str(value),
            None => {
                return Err(ActionError::User(format!(
                    "unknown placeholder '{{{name}}}' in command template '{template}'"
                )))
            }
        }
        rest = &after[close + 1..];
    }
    output.push_str(rest);

    Ok(output)
}

/// Run `command` with `sh -c`, killing it if it does not exit within `timeout`.
///
/// Returns the captured standard output when the command exits with status 0. A non-zero exit
/// yields `ActionError::Execution` carrying the code and captured output, and hitting the timeout
/// yields `ActionError::Timeout`.
pub async fn run_shell(command: &str, timeout: Duration) -> Result<String, ActionError> {
    run_with("sh", command, timeout).await
}

async fn run_with(shell: &str, command: &str, timeout: Duration) -> Result<String, ActionError> {
    log::debug!("running command: {command}");

    let child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("could not run '{shell}': {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            log::warn!("command '{command}' did not finish within {timeout:?}");
            return Err(ActionError::Timeout(format!(
                "after {}s running '{command}'",
                timeout.as_secs()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    // A command killed by a signal has no exit code.
    let code = output.status.code().unwrap_or(-1);
    if code == 0 {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let captured = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    log::debug!("command '{command}' exited with {code}: {captured}");

    Err(ActionError::Execution {
        code,
        output: captured,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("device", "/dev/sdb".to_string()),
            ("mount_path", "/mnt/fs/mdt/0".to_string()),
            ("options", "".to_string()),
        ])
    }

    #[test]
    fn substitution() {
        assert_eq!(
            substitute("mount -t lustre {options} {device} {mount_path}", &vars()).unwrap(),
            "mount -t lustre  /dev/sdb /mnt/fs/mdt/0"
        );
        assert_eq!(substitute("true", &vars()).unwrap(), "true");
        assert!(matches!(
            substitute("mount {devcie}", &vars()),
            Err(ActionError::User(_))
        ));
        assert!(matches!(
            substitute("mount {device", &vars()),
            Err(ActionError::User(_))
        ));
    }

    #[test]
    fn exit_codes_are_classified() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let timeout = Duration::from_secs(10);

            assert_eq!(run_shell("echo hello", timeout).await.unwrap(), "hello\n");

            match run_shell("echo oops >&2; exit 7", timeout).await {
                Err(ActionError::Execution { code, output }) => {
                    assert_eq!(code, 7);
                    assert_eq!(output, "oops");
                }
                other => panic!("unexpected result {other:?}"),
            }

            assert!(matches!(
                run_shell("sleep 5", Duration::from_millis(100)).await,
                Err(ActionError::Timeout(_))
            ));
        });
    }

    #[test]
    fn missing_shell_is_a_runtime_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(run_with("/no/such/sh", "true", Duration::from_secs(10)));
        match result {
            Err(e @ ActionError::Io(_)) => assert_eq!(
                e.rc_flags(crate::component::ComponentKind::Ost),
                crate::rc::RcFlags::RUNTIME_ERROR
            ),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
