use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::constants::DOCKER_INSTALL_SCRIPT_URL;
use crate::context::{ComposeRuntime, DeploymentContext};
use crate::error::ProvisionError;
use crate::exec::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Docker,
    Compose,
    Git,
}

impl ToolName {
    /// Install order matters: the compose plugin needs docker's apt repository.
    pub const ALL: [ToolName; 3] = [ToolName::Docker, ToolName::Compose, ToolName::Git];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Compose => "compose",
            Self::Git => "git",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostState {
    pub tools_installed: BTreeSet<ToolName>,
    pub compose_runtime: Option<ComposeRuntime>,
    pub project_dir_exists: bool,
    pub is_git_repo: bool,
}

impl HostState {
    pub fn has(&self, tool: ToolName) -> bool {
        self.tools_installed.contains(&tool)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProvisionPolicy {
    pub install_missing: bool,
    pub use_sudo: bool,
}

fn privileged(policy: ProvisionPolicy, command: &str) -> String {
    if policy.use_sudo {
        format!("sudo -n sh -c {}", shell_quote(command))
    } else {
        command.to_string()
    }
}

fn install_command(tool: ToolName, policy: ProvisionPolicy) -> String {
    match tool {
        ToolName::Docker => format!(
            "curl -fsSL {DOCKER_INSTALL_SCRIPT_URL} -o /tmp/get-docker.sh && {} && {}",
            privileged(policy, "sh /tmp/get-docker.sh"),
            privileged(policy, "usermod -aG docker \"${SUDO_USER:-$(id -un)}\""),
        ),
        ToolName::Compose => privileged(
            policy,
            "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y docker-compose-plugin",
        ),
        ToolName::Git => privileged(
            policy,
            "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y git",
        ),
    }
}

/// Read-only look at the host: which tools answer and what the project dir holds.
pub fn inspect_host(ctx: &mut DeploymentContext<'_>) -> Result<HostState, ProvisionError> {
    let mut tools_installed = BTreeSet::new();
    if ctx.run("docker --version")?.ok {
        tools_installed.insert(ToolName::Docker);
    }
    let compose_runtime = if ctx.run("docker compose version")?.ok {
        Some(ComposeRuntime::Plugin)
    } else if ctx.run("docker-compose version")?.ok {
        Some(ComposeRuntime::Standalone)
    } else {
        None
    };
    if compose_runtime.is_some() {
        tools_installed.insert(ToolName::Compose);
    }
    if ctx.run("git --version")?.ok {
        tools_installed.insert(ToolName::Git);
    }

    let dir = shell_quote(&ctx.project_dir);
    let project_dir_exists = ctx.run(&format!("test -d {dir}"))?.ok;
    let is_git_repo = project_dir_exists
        && ctx
            .run(&format!("test -e {}", shell_quote(&format!("{}/.git", ctx.project_dir))))?
            .ok;

    Ok(HostState {
        tools_installed,
        compose_runtime,
        project_dir_exists,
        is_git_repo,
    })
}

/// Group membership added by the installer only applies to new logins. When the
/// current session cannot reach the daemon but the group can, route docker calls
/// through `sg docker`.
fn check_daemon_access(ctx: &mut DeploymentContext<'_>) -> Result<(), ProvisionError> {
    if ctx.run("docker info >/dev/null 2>&1")?.ok {
        return Ok(());
    }
    if ctx.run("sg docker -c 'docker info' >/dev/null 2>&1")?.ok {
        tracing::info!(host = %ctx.host_ref, "docker group not active in this session, using sg docker");
        ctx.docker_via_group = true;
    } else {
        tracing::warn!(host = %ctx.host_ref, "docker daemon not reachable after install");
    }
    Ok(())
}

/// Makes sure docker, the compose plugin and git are present, installing what is
/// missing. Probes before acting, so a second run installs nothing.
pub fn ensure_environment(
    ctx: &mut DeploymentContext<'_>,
    policy: ProvisionPolicy,
) -> Result<HostState, ProvisionError> {
    let mut state = inspect_host(ctx)?;
    let mut installed_docker = false;
    for tool in ToolName::ALL {
        if state.has(tool) {
            continue;
        }
        if !policy.install_missing {
            return Err(ProvisionError::InstallDisabled { tool });
        }
        tracing::info!(host = %ctx.host_ref, %tool, "installing missing tool");
        let output = ctx.run(&install_command(tool, policy))?;
        if !output.ok {
            return Err(ProvisionError::InstallFailed {
                tool,
                exit_code: output.returncode,
                detail: output.detail().to_string(),
            });
        }
        state = inspect_host(ctx)?;
        if !state.has(tool) {
            return Err(ProvisionError::StillMissing { tool });
        }
        installed_docker |= tool == ToolName::Docker;
    }
    if installed_docker {
        check_daemon_access(ctx)?;
    }
    if let Some(runtime) = state.compose_runtime {
        ctx.runtime = runtime;
    }
    tracing::info!(
        host = %ctx.host_ref,
        runtime = ctx.runtime.program(),
        project_dir_exists = state.project_dir_exists,
        is_git_repo = state.is_git_repo,
        "environment ready"
    );
    Ok(state)
}
