use chrono::Utc;
use serde::Serialize;

use crate::constants::STASH_PREFIX;
use crate::context::DeploymentContext;
use crate::desired::DesiredRevision;
use crate::error::{SyncError, SyncFailure};
use crate::exec::{shell_quote, CommandOutput};

/// A checkout confirmed to be at the revision the run will deploy.
///
/// Only `sync_repository` and `Checkout::inspect` construct one; the reconciler takes
/// it as proof that destructive compose actions are allowed.
#[derive(Debug, Clone, Serialize)]
pub struct Checkout {
    pub revision: String,
    pub branch: Option<String>,
    pub stashed: Option<String>,
    pub recloned: bool,
    #[serde(skip)]
    _confirmed: (),
}

impl Checkout {
    /// Reads the current revision of an existing checkout without changing it.
    pub fn inspect(ctx: &mut DeploymentContext<'_>) -> Result<Checkout, SyncFailure> {
        let marker = shell_quote(&format!("{}/.git", ctx.project_dir));
        let probe = ctx.run(&format!("test -e {marker}"))?;
        if !probe.ok {
            return Err(SyncError {
                step: "inspect".to_string(),
                exit_code: probe.returncode,
                detail: format!("{} is not a git checkout", ctx.project_dir),
            }
            .into());
        }
        confirm(ctx, None, false)
    }
}

fn git(ctx: &DeploymentContext<'_>, args: &str) -> String {
    format!("git -C {} {args}", shell_quote(&ctx.project_dir))
}

fn require(output: CommandOutput, step: &str) -> Result<CommandOutput, SyncError> {
    if output.ok {
        Ok(output)
    } else {
        Err(SyncError {
            step: step.to_string(),
            exit_code: output.returncode,
            detail: output.detail().to_string(),
        })
    }
}

fn clone(ctx: &mut DeploymentContext<'_>, desired: &DesiredRevision) -> Result<(), SyncFailure> {
    let command = format!(
        "git clone {} {}",
        shell_quote(&desired.repo_url),
        shell_quote(&ctx.project_dir)
    );
    require(ctx.run(&command)?, "clone")?;
    if let Some(git_ref) = &desired.git_ref {
        let checkout = git(ctx, &format!("checkout {}", shell_quote(git_ref)));
        require(ctx.run(&checkout)?, "checkout")?;
    }
    Ok(())
}

fn current_branch(ctx: &mut DeploymentContext<'_>) -> Result<Option<String>, SyncFailure> {
    let output = ctx.run(&git(ctx, "symbolic-ref -q --short HEAD"))?;
    Ok(if output.ok && !output.stdout.is_empty() {
        Some(output.stdout)
    } else {
        None
    })
}

fn confirm(
    ctx: &mut DeploymentContext<'_>,
    stashed: Option<String>,
    recloned: bool,
) -> Result<Checkout, SyncFailure> {
    let revision = require(ctx.run(&git(ctx, "rev-parse HEAD"))?, "rev-parse")?
        .stdout
        .trim()
        .to_string();
    let branch = current_branch(ctx)?;
    Ok(Checkout {
        revision,
        branch,
        stashed,
        recloned,
        _confirmed: (),
    })
}

/// Stashes local edits under a timestamped name; `None` when the tree is clean.
fn snapshot_local_changes(ctx: &mut DeploymentContext<'_>) -> Result<Option<String>, SyncFailure> {
    let status = require(ctx.run(&git(ctx, "status --porcelain"))?, "status")?;
    if status.stdout.trim().is_empty() {
        return Ok(None);
    }
    let name = format!("{STASH_PREFIX}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let command = git(
        ctx,
        &format!("stash push --include-untracked -m {}", shell_quote(&name)),
    );
    require(ctx.run(&command)?, "stash")?;
    tracing::info!(host = %ctx.host_ref, stash = %name, "stashed local changes before update");
    Ok(Some(name))
}

fn update(ctx: &mut DeploymentContext<'_>, desired: &DesiredRevision) -> Result<Checkout, SyncFailure> {
    let stashed = snapshot_local_changes(ctx)?;
    require(ctx.run(&git(ctx, "fetch --all --prune --tags"))?, "fetch")?;

    match &desired.git_ref {
        Some(git_ref) => {
            let checkout = git(ctx, &format!("checkout {}", shell_quote(git_ref)));
            require(ctx.run(&checkout)?, "checkout")?;
            // Tags and commits leave HEAD detached; only branches have an upstream.
            if current_branch(ctx)?.is_some() {
                require(ctx.run(&git(ctx, "pull --ff-only"))?, "pull")?;
            }
        }
        None => {
            let mut switched = false;
            for branch in ["main", "master"] {
                if ctx.run(&git(ctx, &format!("checkout {branch}")))?.ok {
                    switched = true;
                    break;
                }
            }
            if !switched {
                tracing::warn!(
                    host = %ctx.host_ref,
                    "neither main nor master exists; staying on the current branch"
                );
            }
            require(ctx.run(&git(ctx, "pull --ff-only"))?, "pull")?;
        }
    }
    confirm(ctx, stashed, false)
}

/// Clone-or-update of the deployment checkout in `ctx.project_dir`.
pub fn sync_repository(
    ctx: &mut DeploymentContext<'_>,
    desired: &DesiredRevision,
) -> Result<Checkout, SyncFailure> {
    let dir = shell_quote(&ctx.project_dir);
    if !ctx.run(&format!("test -d {dir}"))?.ok {
        tracing::info!(host = %ctx.host_ref, dir = %ctx.project_dir, "cloning deployment repository");
        clone(ctx, desired)?;
        return confirm(ctx, None, false);
    }

    let marker = shell_quote(&format!("{}/.git", ctx.project_dir));
    if !ctx.run(&format!("test -e {marker}"))?.ok {
        tracing::warn!(
            host = %ctx.host_ref,
            dir = %ctx.project_dir,
            "project directory is not a git checkout; removing and cloning again"
        );
        require(ctx.run(&format!("rm -rf {dir}"))?, "remove")?;
        clone(ctx, desired)?;
        return confirm(ctx, None, true);
    }

    let checkout = update(ctx, desired)?;
    tracing::info!(
        host = %ctx.host_ref,
        revision = %checkout.revision,
        branch = ?checkout.branch,
        "repository synchronized"
    );
    Ok(checkout)
}
