use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_COMPOSE_FILE, DEFAULT_CONFIG_FILE, DEFAULT_HEALTH_INITIAL_BACKOFF_MS,
    DEFAULT_HEALTH_MAX_BACKOFF_MS, DEFAULT_HEALTH_TIMEOUT_SECS, DEFAULT_IMAGE_ENV_VAR,
    DEFAULT_LOG_TAIL_LINES, DEFAULT_SETTLE_SECS, DEFAULT_SSH_COMMAND_TIMEOUT_SECS,
    DEFAULT_SSH_PORT, DEFAULT_STATE_DIR, DEFAULT_TAG_ENV_VAR,
};
use crate::context::ComposeSettings;
use crate::desired::{DesiredRevision, ImageReference};
use crate::exec::{CommandExecutor, LocalExecutor};
use crate::health::HealthPolicy;
use crate::probe::ProvisionPolicy;
use crate::reconcile::ReconcilePolicy;
use crate::ssh::{SshExecutor, SshTarget};

const REDACTED: &str = "<redacted>";

pub fn resolve_config_path(path: Option<PathBuf>) -> PathBuf {
    path.or_else(|| std::env::var_os("DEPLOYCTL_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_user() -> String {
    "deploy".to_string()
}

fn default_known_hosts_path() -> String {
    "~/.ssh/known_hosts".to_string()
}

fn default_ssh_command_timeout_seconds() -> u64 {
    DEFAULT_SSH_COMMAND_TIMEOUT_SECS
}

fn default_project_dir() -> String {
    "/srv/app".to_string()
}

fn default_compose_file() -> String {
    DEFAULT_COMPOSE_FILE.to_string()
}

fn default_image_env_var() -> String {
    DEFAULT_IMAGE_ENV_VAR.to_string()
}

fn default_tag_env_var() -> String {
    DEFAULT_TAG_ENV_VAR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_settle_seconds() -> u64 {
    DEFAULT_SETTLE_SECS
}

fn default_health_timeout_seconds() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

fn default_health_initial_backoff_ms() -> u64 {
    DEFAULT_HEALTH_INITIAL_BACKOFF_MS
}

fn default_health_max_backoff_ms() -> u64 {
    DEFAULT_HEALTH_MAX_BACKOFF_MS
}

fn default_log_tail_lines() -> usize {
    DEFAULT_LOG_TAIL_LINES
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Target host; `None` runs everything on this machine.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub ssh_key_passphrase: Option<String>,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: String,
    /// Approved `SHA256:...` fingerprint used to pin an unknown host key on first use.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_ssh_command_timeout_seconds")]
    pub ssh_command_timeout_seconds: u64,

    #[serde(default = "default_project_dir")]
    pub project_dir: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default = "default_compose_file")]
    pub compose_file: String,
    #[serde(default)]
    pub compose_project_name: Option<String>,
    #[serde(default = "default_image_env_var")]
    pub image_env_var: String,
    #[serde(default = "default_tag_env_var")]
    pub tag_env_var: String,

    #[serde(default = "default_true")]
    pub install_missing: bool,
    #[serde(default = "default_true")]
    pub use_sudo: bool,
    #[serde(default = "default_true")]
    pub prune_images: bool,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: u64,
    #[serde(default = "default_health_timeout_seconds")]
    pub health_timeout_seconds: u64,
    #[serde(default = "default_health_initial_backoff_ms")]
    pub health_initial_backoff_ms: u64,
    #[serde(default = "default_health_max_backoff_ms")]
    pub health_max_backoff_ms: u64,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    #[serde(default)]
    pub excluded_services: Vec<String>,

    /// Local directory for state.json and the run history.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            user: default_user(),
            ssh_key_path: None,
            ssh_key_passphrase: None,
            ssh_password: None,
            known_hosts_path: default_known_hosts_path(),
            host_key_fingerprint: None,
            ssh_command_timeout_seconds: default_ssh_command_timeout_seconds(),
            project_dir: default_project_dir(),
            repo_url: String::new(),
            git_ref: None,
            image: None,
            compose_file: default_compose_file(),
            compose_project_name: None,
            image_env_var: default_image_env_var(),
            tag_env_var: default_tag_env_var(),
            install_missing: true,
            use_sudo: true,
            prune_images: true,
            auto_rollback: true,
            settle_seconds: default_settle_seconds(),
            health_timeout_seconds: default_health_timeout_seconds(),
            health_initial_backoff_ms: default_health_initial_backoff_ms(),
            health_max_backoff_ms: default_health_max_backoff_ms(),
            log_tail_lines: default_log_tail_lines(),
            excluded_services: Vec::new(),
            state_dir: default_state_dir(),
        }
    }
}

/// Values given on the command line; applied after the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub project_dir: Option<String>,
    pub git_ref: Option<String>,
    pub image: Option<String>,
}

pub fn load_config(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        return Ok(DeployConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))
}

pub fn save_config(path: &Path, config: &DeployConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Applies `DEPLOY_*` variables as read through `lookup`.
pub fn apply_env_overrides(
    config: &mut DeployConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |key: &str| non_empty(lookup(key));
    if let Some(host) = get("DEPLOY_HOST") {
        config.host = Some(host);
    }
    if let Some(port) = get("DEPLOY_PORT") {
        config.port = port
            .parse()
            .with_context(|| format!("DEPLOY_PORT is not a valid port: {port}"))?;
    }
    if let Some(user) = get("DEPLOY_USER") {
        config.user = user;
    }
    if let Some(key) = get("DEPLOY_SSH_KEY") {
        config.ssh_key_path = Some(key);
    }
    if let Some(passphrase) = get("DEPLOY_SSH_PASSPHRASE") {
        config.ssh_key_passphrase = Some(passphrase);
    }
    if let Some(password) = get("DEPLOY_SSH_PASSWORD") {
        config.ssh_password = Some(password);
    }
    if let Some(fingerprint) = get("DEPLOY_HOST_FINGERPRINT") {
        config.host_key_fingerprint = Some(fingerprint);
    }
    if let Some(dir) = get("DEPLOY_PROJECT_DIR") {
        config.project_dir = dir;
    }
    if let Some(url) = get("DEPLOY_REPO_URL") {
        config.repo_url = url;
    }
    if let Some(git_ref) = get("DEPLOY_REF") {
        config.git_ref = Some(git_ref);
    }
    if let Some(image) = get("DEPLOY_IMAGE") {
        config.image = Some(image);
    }
    Ok(())
}

pub fn apply_overrides(config: &mut DeployConfig, overrides: &Overrides) {
    if let Some(host) = non_empty(overrides.host.clone()) {
        config.host = Some(host);
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(user) = non_empty(overrides.user.clone()) {
        config.user = user;
    }
    if let Some(dir) = non_empty(overrides.project_dir.clone()) {
        config.project_dir = dir;
    }
    if let Some(git_ref) = non_empty(overrides.git_ref.clone()) {
        config.git_ref = Some(git_ref);
    }
    if let Some(image) = non_empty(overrides.image.clone()) {
        config.image = Some(image);
    }
}

/// Zero or empty values fall back to their defaults.
pub fn normalize_config(config: &mut DeployConfig) {
    if config.port == 0 {
        config.port = default_port();
    }
    if config.user.trim().is_empty() {
        config.user = default_user();
    }
    if config.known_hosts_path.trim().is_empty() {
        config.known_hosts_path = default_known_hosts_path();
    }
    if config.ssh_command_timeout_seconds == 0 {
        config.ssh_command_timeout_seconds = default_ssh_command_timeout_seconds();
    }
    if config.project_dir.trim().is_empty() {
        config.project_dir = default_project_dir();
    }
    if config.compose_file.trim().is_empty() {
        config.compose_file = default_compose_file();
    }
    if config.image_env_var.trim().is_empty() {
        config.image_env_var = default_image_env_var();
    }
    if config.tag_env_var.trim().is_empty() {
        config.tag_env_var = default_tag_env_var();
    }
    if config.health_initial_backoff_ms == 0 {
        config.health_initial_backoff_ms = default_health_initial_backoff_ms();
    }
    if config.health_max_backoff_ms < config.health_initial_backoff_ms {
        config.health_max_backoff_ms = config
            .health_initial_backoff_ms
            .max(default_health_max_backoff_ms());
    }
    if config.log_tail_lines == 0 {
        config.log_tail_lines = default_log_tail_lines();
    }
    if config.state_dir.trim().is_empty() {
        config.state_dir = default_state_dir();
    }
    config.host = non_empty(config.host.take());
    config.ssh_key_path = non_empty(config.ssh_key_path.take());
    config.git_ref = non_empty(config.git_ref.take());
    config.image = non_empty(config.image.take());
    config.compose_project_name = non_empty(config.compose_project_name.take());
}

/// File, then `DEPLOY_*` environment, then command line.
pub fn effective_config(path: &Path, overrides: &Overrides) -> Result<DeployConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    apply_overrides(&mut config, overrides);
    normalize_config(&mut config);
    Ok(config)
}

impl DeployConfig {
    pub fn redacted(&self) -> DeployConfig {
        let mut copy = self.clone();
        for secret in [&mut copy.ssh_key_passphrase, &mut copy.ssh_password] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        copy
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }

    pub fn image_reference(&self) -> Result<Option<ImageReference>> {
        self.image
            .as_deref()
            .map(|raw| {
                raw.parse::<ImageReference>()
                    .with_context(|| format!("Invalid image reference: {raw}"))
            })
            .transpose()
    }

    pub fn desired_revision(&self) -> Result<DesiredRevision> {
        if self.repo_url.trim().is_empty() {
            bail!("repo_url is not configured (set it in the config file or DEPLOY_REPO_URL)");
        }
        Ok(DesiredRevision {
            repo_url: self.repo_url.trim().to_string(),
            git_ref: self.git_ref.clone(),
            image: self.image_reference()?,
        })
    }

    pub fn compose_settings(&self) -> ComposeSettings {
        ComposeSettings {
            compose_file: self.compose_file.clone(),
            project_name: self.compose_project_name.clone(),
            image_env_var: self.image_env_var.clone(),
            tag_env_var: self.tag_env_var.clone(),
        }
    }

    pub fn provision_policy(&self) -> ProvisionPolicy {
        ProvisionPolicy {
            install_missing: self.install_missing,
            use_sudo: self.use_sudo,
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            settle: Duration::from_secs(self.settle_seconds),
            prune_images: self.prune_images,
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            timeout: Duration::from_secs(self.health_timeout_seconds),
            initial_backoff: Duration::from_millis(self.health_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.health_max_backoff_ms),
            log_tail_lines: self.log_tail_lines,
            excluded_services: self.excluded_services.clone(),
        }
    }

    pub fn ssh_target(&self) -> Option<SshTarget> {
        let host = self.host.clone()?;
        Some(SshTarget {
            host,
            port: self.port,
            username: self.user.clone(),
            private_key_path: self.ssh_key_path.as_deref().map(expand_home),
            private_key_passphrase: self.ssh_key_passphrase.clone(),
            password: self.ssh_password.clone(),
            known_hosts_path: expand_home(&self.known_hosts_path),
            host_key_fingerprint: self.host_key_fingerprint.clone(),
            command_timeout: Duration::from_secs(self.ssh_command_timeout_seconds),
        })
    }

    /// SSH when a host is configured, otherwise the local shell.
    pub fn connect(&self) -> Result<Box<dyn CommandExecutor>> {
        match self.ssh_target() {
            Some(target) => {
                tracing::info!(host = %target.host, port = target.port, user = %target.username, "connecting");
                Ok(Box::new(SshExecutor::connect(target)?))
            }
            None => Ok(Box::new(LocalExecutor)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("deployctl.json")).unwrap();
        assert_eq!(config, DeployConfig::default());
        assert_eq!(config.port, 22);
        assert_eq!(config.compose_file, "docker-compose.yml");
        assert_eq!(config.health_timeout_seconds, 120);
        assert!(config.auto_rollback);
        assert!(config.host.is_none());
    }

    #[test]
    fn file_env_and_flags_layer_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployctl.json");
        fs::write(
            &path,
            r#"{"host": "erp.example.com", "user": "ops", "repo_url": "https://github.com/acme/erp-deploy.git", "image": "ghcr.io/acme/erp:v1"}"#,
        )
        .unwrap();
        let mut config = load_config(&path).unwrap();
        apply_env_overrides(
            &mut config,
            env(&[("DEPLOY_IMAGE", "ghcr.io/acme/erp:v2"), ("DEPLOY_PORT", "2222")]),
        )
        .unwrap();
        apply_overrides(
            &mut config,
            &Overrides {
                image: Some("ghcr.io/acme/erp:v3".to_string()),
                ..Overrides::default()
            },
        );
        normalize_config(&mut config);

        assert_eq!(config.user, "ops");
        assert_eq!(config.port, 2222);
        assert_eq!(config.image.as_deref(), Some("ghcr.io/acme/erp:v3"));
        let desired = config.desired_revision().unwrap();
        assert_eq!(desired.image.unwrap().tag.as_deref(), Some("v3"));
    }

    #[test]
    fn invalid_env_port_is_rejected() {
        let mut config = DeployConfig::default();
        let err = apply_env_overrides(&mut config, env(&[("DEPLOY_PORT", "ssh")])).unwrap_err();
        assert!(err.to_string().contains("DEPLOY_PORT"));
    }

    #[test]
    fn zero_and_empty_values_normalize() {
        let mut config: DeployConfig = serde_json::from_str(
            r#"{"port": 0, "project_dir": " ", "log_tail_lines": 0, "host": "", "health_timeout_seconds": 0}"#,
        )
        .unwrap();
        normalize_config(&mut config);
        assert_eq!(config.port, 22);
        assert_eq!(config.project_dir, "/srv/app");
        assert_eq!(config.log_tail_lines, 50);
        assert!(config.host.is_none());
        // Zero timeout is meaningful: a single health poll.
        assert_eq!(config.health_timeout_seconds, 0);
    }

    #[test]
    fn redaction_hides_secrets() {
        let mut config = DeployConfig::default();
        config.ssh_password = Some("hunter2".to_string());
        config.ssh_key_passphrase = Some("open sesame".to_string());
        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("open sesame"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn missing_repo_url_is_an_error() {
        let config = DeployConfig::default();
        assert!(config.desired_revision().is_err());
        assert!(config.ssh_target().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deployctl.json");
        let mut config = DeployConfig::default();
        config.excluded_services = vec!["configurator".to_string()];
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn config_path_honours_environment() {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = "DEPLOYCTL_CONFIG";
        let previous = std::env::var(key).ok();
        std::env::set_var(key, "/etc/deployctl/prod.json");
        let from_env = resolve_config_path(None);
        let explicit = resolve_config_path(Some(PathBuf::from("local.json")));
        match previous {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
        assert_eq!(from_env, PathBuf::from("/etc/deployctl/prod.json"));
        assert_eq!(explicit, PathBuf::from("local.json"));
    }
}
