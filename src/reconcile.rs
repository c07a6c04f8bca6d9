use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

use crate::compose::{parse_config_json, parse_service_names, ServiceSpec};
use crate::constants::SNAPSHOT_DIR;
use crate::context::DeploymentContext;
use crate::error::ReconcileError;
use crate::exec::{shell_quote, CommandOutput};
use crate::stage::{Stage, StageLog};
use crate::sync::Checkout;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    /// Wait after `up` before the health verifier takes over.
    pub settle: Duration,
    pub prune_images: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub revision: String,
    pub image_reference: Option<String>,
    pub services: Vec<ServiceSpec>,
    pub snapshot_path: Option<String>,
}

fn transport(stage: Stage) -> impl FnOnce(anyhow::Error) -> ReconcileError {
    move |source| ReconcileError::Transport { stage, source }
}

fn step(
    ctx: &mut DeploymentContext<'_>,
    log: &mut StageLog,
    stage: Stage,
    command: &str,
) -> Result<CommandOutput, ReconcileError> {
    log.start(stage);
    let output = match ctx.run(command) {
        Ok(output) => output,
        Err(err) => {
            log.finish(stage, false, Some(format!("{err:#}")));
            return Err(transport(stage)(err));
        }
    };
    if output.ok {
        log.finish(stage, true, None);
        return Ok(output);
    }
    log.finish(
        stage,
        false,
        Some(format!("exit {}: {}", output.returncode, output.detail())),
    );
    let detail = output.detail().to_string();
    Err(match stage {
        Stage::Pull => ReconcileError::Pull {
            exit_code: output.returncode,
            detail,
        },
        _ => ReconcileError::Stage {
            stage,
            exit_code: output.returncode,
            detail,
        },
    })
}

/// Compose file present and parseable; returns the services it declares.
pub fn load_services(ctx: &mut DeploymentContext<'_>) -> Result<Vec<ServiceSpec>, ReconcileError> {
    let stage = Stage::Precondition;
    let path = ctx.compose_path();
    let exists = ctx
        .run(&format!("test -f {}", shell_quote(&path)))
        .map_err(transport(stage))?;
    if !exists.ok {
        return Err(ReconcileError::ConfigMissing { path });
    }

    let json = ctx
        .run(&ctx.compose_command("config --format json"))
        .map_err(transport(stage))?;
    if json.ok {
        if let Ok(specs) = parse_config_json(&json.stdout) {
            return Ok(specs);
        }
    }
    let names = ctx
        .run(&ctx.compose_command("config --services"))
        .map_err(transport(stage))?;
    if !names.ok {
        return Err(ReconcileError::Stage {
            stage,
            exit_code: names.returncode,
            detail: names.detail().to_string(),
        });
    }
    Ok(parse_service_names(&names.stdout))
}

/// Best effort: records `compose ps` output next to the project before anything changes.
fn snapshot(ctx: &mut DeploymentContext<'_>, log: &mut StageLog) -> Option<String> {
    log.start(Stage::Snapshot);
    let path = format!(
        "{SNAPSHOT_DIR}/ps-{}.json",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    let command = ctx.in_project(&format!(
        "mkdir -p {SNAPSHOT_DIR} && {}",
        ctx.compose_invocation(&format!("ps -a --format json > {}", shell_quote(&path)))
    ));
    match ctx.run(&command) {
        Ok(output) if output.ok => {
            log.finish(Stage::Snapshot, true, Some(path.clone()));
            Some(format!("{}/{path}", ctx.project_dir.trim_end_matches('/')))
        }
        Ok(output) => {
            tracing::warn!(exit = output.returncode, detail = output.detail(), "state snapshot skipped");
            log.finish(Stage::Snapshot, false, Some("snapshot skipped".to_string()));
            None
        }
        Err(err) => {
            tracing::warn!("state snapshot skipped: {err:#}");
            log.finish(Stage::Snapshot, false, Some("snapshot skipped".to_string()));
            None
        }
    }
}

fn prune(ctx: &mut DeploymentContext<'_>, log: &mut StageLog) {
    log.start(Stage::Prune);
    match ctx.run(&ctx.docker("docker image prune -f")) {
        Ok(output) if output.ok => log.finish(Stage::Prune, true, None),
        Ok(output) => {
            tracing::warn!(exit = output.returncode, detail = output.detail(), "image prune failed");
            log.finish(Stage::Prune, false, Some("prune failed".to_string()));
        }
        Err(err) => {
            tracing::warn!("image prune failed: {err:#}");
            log.finish(Stage::Prune, false, Some("prune failed".to_string()));
        }
    }
}

/// Pull, tear down (with orphans) and force-recreate the stack at `ctx.image`.
///
/// Each step aborts the rest on failure. A failed pull leaves running containers
/// untouched.
pub fn reconcile(
    ctx: &mut DeploymentContext<'_>,
    checkout: &Checkout,
    policy: ReconcilePolicy,
    log: &mut StageLog,
) -> Result<ReconcileSummary, ReconcileError> {
    log.start(Stage::Precondition);
    let services = match load_services(ctx) {
        Ok(services) => {
            log.finish(
                Stage::Precondition,
                true,
                Some(format!("{} services declared", services.len())),
            );
            services
        }
        Err(err) => {
            log.finish(Stage::Precondition, false, Some(err.to_string()));
            return Err(err);
        }
    };

    let snapshot_path = snapshot(ctx, log);

    let steps = [
        (Stage::Pull, ctx.compose_command("pull")),
        (Stage::Down, ctx.compose_command("down --remove-orphans")),
        (
            Stage::Up,
            ctx.compose_command("up -d --force-recreate --remove-orphans"),
        ),
    ];
    for (stage, command) in steps {
        step(ctx, log, stage, &command)?;
    }

    log.start(Stage::Settle);
    if !policy.settle.is_zero() {
        tracing::info!(seconds = policy.settle.as_secs(), "waiting for containers to settle");
        std::thread::sleep(policy.settle);
    }
    log.finish(Stage::Settle, true, None);

    if policy.prune_images {
        prune(ctx, log);
    } else {
        log.skip(Stage::Prune, "disabled");
    }

    tracing::info!(
        host = %ctx.host_ref,
        revision = %checkout.revision,
        image = ?ctx.image.as_ref().map(ToString::to_string),
        "stack reconciled"
    );
    Ok(ReconcileSummary {
        revision: checkout.revision.clone(),
        image_reference: ctx.image.as_ref().map(ToString::to_string),
        services,
        snapshot_path,
    })
}
