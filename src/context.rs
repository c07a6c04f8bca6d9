use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::desired::ImageReference;
use crate::exec::{shell_quote, CommandExecutor, CommandOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeRuntime {
    /// `docker compose` (v2 plugin)
    Plugin,
    /// legacy `docker-compose` binary
    Standalone,
}

impl ComposeRuntime {
    pub fn program(self) -> &'static str {
        match self {
            Self::Plugin => "docker compose",
            Self::Standalone => "docker-compose",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComposeSettings {
    /// Relative to the project directory unless absolute.
    pub compose_file: String,
    pub project_name: Option<String>,
    pub image_env_var: String,
    pub tag_env_var: String,
}

/// Everything a pipeline stage needs to act on one target.
pub struct DeploymentContext<'a> {
    executor: &'a mut dyn CommandExecutor,
    pub host_ref: String,
    pub project_dir: String,
    pub runtime: ComposeRuntime,
    pub compose: ComposeSettings,
    pub image: Option<ImageReference>,
    /// Docker was installed during this session and the login predates the
    /// `docker` group membership, so docker calls go through `sg docker`.
    pub docker_via_group: bool,
}

impl<'a> DeploymentContext<'a> {
    pub fn new(
        executor: &'a mut dyn CommandExecutor,
        project_dir: impl Into<String>,
        compose: ComposeSettings,
        image: Option<ImageReference>,
    ) -> Self {
        let host_ref = executor.host_ref();
        Self {
            executor,
            host_ref,
            project_dir: project_dir.into(),
            runtime: ComposeRuntime::Plugin,
            compose,
            image,
            docker_via_group: false,
        }
    }

    /// Runs a command, echoing it and its output at debug level.
    pub fn run(&mut self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(host = %self.host_ref, "$ {command}");
        let output = self.executor.run(command)?;
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            let line = line.trim_end();
            if !line.is_empty() {
                tracing::debug!(host = %self.host_ref, "{line}");
            }
        }
        if !output.ok {
            tracing::debug!(host = %self.host_ref, exit = output.returncode, "command failed");
        }
        Ok(output)
    }

    /// Wraps a command that talks to the docker daemon.
    pub fn docker(&self, command: &str) -> String {
        if self.docker_via_group {
            format!("sg docker -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }

    pub fn in_project(&self, command: &str) -> String {
        format!("cd {} && {command}", shell_quote(&self.project_dir))
    }

    pub fn compose_path(&self) -> String {
        if self.compose.compose_file.starts_with('/') {
            self.compose.compose_file.clone()
        } else {
            format!(
                "{}/{}",
                self.project_dir.trim_end_matches('/'),
                self.compose.compose_file
            )
        }
    }

    /// Full compose invocation inside the project directory, with the target image
    /// exported for `${VAR}` interpolation in the compose file.
    pub fn compose_command(&self, args: &str) -> String {
        self.in_project(&self.compose_invocation(args))
    }

    /// Same as `compose_command` without the leading `cd`.
    pub fn compose_invocation(&self, args: &str) -> String {
        let mut command = String::new();
        if let Some(image) = &self.image {
            command.push_str(&format!(
                "{}={} {}={} ",
                self.compose.image_env_var,
                shell_quote(&image.repository),
                self.compose.tag_env_var,
                shell_quote(&image.compose_tag())
            ));
        }
        command.push_str(self.runtime.program());
        command.push_str(" -f ");
        command.push_str(&shell_quote(&self.compose.compose_file));
        if let Some(name) = &self.compose.project_name {
            command.push_str(" -p ");
            command.push_str(&shell_quote(name));
        }
        command.push(' ');
        command.push_str(args);
        self.docker(&command)
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> ComposeSettings {
    ComposeSettings {
        compose_file: "docker-compose.yml".to_string(),
        project_name: None,
        image_env_var: "CUSTOM_IMAGE".to_string(),
        tag_env_var: "CUSTOM_TAG".to_string(),
    }
}
