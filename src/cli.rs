use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Overrides;
use crate::constants::DEFAULT_SSH_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "deployctl",
    version,
    about = "Converge a host's docker compose stack to a desired revision and image"
)]
pub struct Cli {
    /// Config file (default: $DEPLOYCTL_CONFIG or ./deployctl.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision, sync, reconcile and verify in one run
    Deploy(DeployArgs),
    /// Report which tools the target has (and install missing ones with --install)
    Probe(ProbeArgs),
    /// Clone or update the deployment checkout
    Sync(SyncArgs),
    /// Check the running stack against its compose file
    Verify(VerifyArgs),
    /// Reconcile back to the previous known-good image
    Rollback(RollbackArgs),
    /// Show the local deploy state
    Status(StatusArgs),
    /// Print a host's SSH key fingerprint for pinning
    Hostkey(HostkeyArgs),
    Apps(AppsArgs),
    Config(ConfigArgs),
}

#[derive(Args, Clone, Default)]
pub struct TargetArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub project_dir: Option<String>,
}

impl TargetArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            project_dir: self.project_dir.clone(),
            ..Overrides::default()
        }
    }
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Image to deploy, e.g. ghcr.io/acme/erp:v15.4.0
    #[arg(long)]
    pub image: Option<String>,
    /// Branch, tag or commit of the deployment repository
    #[arg(long = "ref")]
    pub git_ref: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_rollback: bool,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long, default_value_t = false)]
    pub install: bool,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct SyncArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long = "ref")]
    pub git_ref: Option<String>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Roll back to this image instead of the previous known-good one
    #[arg(long)]
    pub image: Option<String>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct StatusArgs {
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct HostkeyArgs {
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    pub port: u16,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct AppsArgs {
    #[command(subcommand)]
    pub command: AppsCommand,
}

#[derive(Subcommand)]
pub enum AppsCommand {
    /// Validate an apps.json manifest and print it as APPS_JSON_BASE64
    Encode(AppsEncodeArgs),
}

#[derive(Args)]
pub struct AppsEncodeArgs {
    #[arg(long)]
    pub file: PathBuf,
    /// Print as `export APPS_JSON_BASE64=...`
    #[arg(long, default_value_t = false)]
    pub export: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Write a config file with default values
    Init(ConfigInitArgs),
    /// Print the effective config with secrets redacted
    Show,
}

#[derive(Args)]
pub struct ConfigInitArgs {
    #[arg(long, default_value_t = false)]
    pub force: bool,
}
