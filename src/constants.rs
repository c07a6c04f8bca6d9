pub const DEFAULT_CONFIG_FILE: &str = "deployctl.json";
pub const DEFAULT_STATE_DIR: &str = ".deployctl";
pub const STATE_FILE: &str = "state.json";
pub const HISTORY_FILE: &str = "history.jsonl";
pub const MAX_HISTORY_ENTRIES: usize = 50;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_COMMAND_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_IMAGE_ENV_VAR: &str = "CUSTOM_IMAGE";
pub const DEFAULT_TAG_ENV_VAR: &str = "CUSTOM_TAG";

pub const DEFAULT_SETTLE_SECS: u64 = 5;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HEALTH_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_LOG_TAIL_LINES: usize = 50;

/// Relative to the project directory on the target host.
pub const SNAPSHOT_DIR: &str = ".deployctl/backups";
pub const STASH_PREFIX: &str = "deployctl";

pub const DOCKER_INSTALL_SCRIPT_URL: &str = "https://get.docker.com";
