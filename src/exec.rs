use anyhow::{Context, Result};
use serde::Serialize;
use std::process::Command;

/// Outcome of one shell command on the target host.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl CommandOutput {
    /// stderr when present, stdout otherwise; used in error details.
    pub fn detail(&self) -> &str {
        if self.stderr.is_empty() {
            self.stdout.as_str()
        } else {
            self.stderr.as_str()
        }
    }
}

/// Runs shell command lines on the host being reconciled.
///
/// `Err` is reserved for transport failures (spawn, SSH channel); a command that
/// runs and exits non-zero comes back as `Ok` with `ok == false`.
pub trait CommandExecutor {
    fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Short label for logs and reports, e.g. `local` or `deploy@10.0.0.5:22`.
    fn host_ref(&self) -> String;
}

pub struct LocalExecutor;

impl CommandExecutor for LocalExecutor {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let output = cmd
            .output()
            .with_context(|| format!("Failed to spawn sh -c {command}"))?;
        Ok(CommandOutput {
            command: command.to_string(),
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            returncode: output.status.code().unwrap_or(-1),
        })
    }

    fn host_ref(&self) -> String {
        "local".to_string()
    }
}

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '='))
    {
        return value.to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    struct Rule {
        pattern: String,
        outputs: Vec<(bool, i32, String, String)>,
    }

    /// In-memory executor: records every command and answers from scripted rules.
    ///
    /// The first rule whose pattern is a substring of the command wins. A rule with
    /// several outputs yields them in order and then repeats the last one. Commands
    /// with no matching rule succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        rules: Vec<Rule>,
        pub log: Vec<String>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(mut self, pattern: &str, stdout: &str) -> Self {
            self.push(pattern, (true, 0, stdout.to_string(), String::new()));
            self
        }

        pub fn fail(mut self, pattern: &str, code: i32, stderr: &str) -> Self {
            self.push(pattern, (false, code, String::new(), stderr.to_string()));
            self
        }

        fn push(&mut self, pattern: &str, output: (bool, i32, String, String)) {
            if let Some(rule) = self.rules.iter_mut().find(|rule| rule.pattern == pattern) {
                rule.outputs.push(output);
            } else {
                self.rules.push(Rule {
                    pattern: pattern.to_string(),
                    outputs: vec![output],
                });
            }
        }

        pub fn ran(&self, fragment: &str) -> bool {
            self.log.iter().any(|cmd| cmd.contains(fragment))
        }

        pub fn count(&self, fragment: &str) -> usize {
            self.log.iter().filter(|cmd| cmd.contains(fragment)).count()
        }

        pub fn position(&self, fragment: &str) -> Option<usize> {
            self.log.iter().position(|cmd| cmd.contains(fragment))
        }
    }

    impl CommandExecutor for ScriptedExecutor {
        fn run(&mut self, command: &str) -> Result<CommandOutput> {
            self.log.push(command.to_string());
            let scripted = self
                .rules
                .iter_mut()
                .find(|rule| command.contains(rule.pattern.as_str()))
                .map(|rule| {
                    if rule.outputs.len() > 1 {
                        rule.outputs.remove(0)
                    } else {
                        rule.outputs[0].clone()
                    }
                });
            let (ok, returncode, stdout, stderr) =
                scripted.unwrap_or((true, 0, String::new(), String::new()));
            Ok(CommandOutput {
                command: command.to_string(),
                ok,
                stdout,
                stderr,
                returncode,
            })
        }

        fn host_ref(&self) -> String {
            "scripted".to_string()
        }
    }
}
