use chrono::Utc;
use std::path::PathBuf;

use crate::context::DeploymentContext;
use crate::desired::{DesiredRevision, ImageReference};
use crate::error::{DeployError, HealthError};
use crate::health::{verify, HealthPolicy};
use crate::probe::{ensure_environment, ProvisionPolicy};
use crate::reconcile::{reconcile, ReconcilePolicy};
use crate::report::{DeploymentResult, RollbackOutcome};
use crate::stage::{Stage, StageLog};
use crate::state::{load_state, save_state, DeployState};
use crate::sync::{sync_repository, Checkout};

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub provision: ProvisionPolicy,
    pub reconcile: ReconcilePolicy,
    pub health: HealthPolicy,
    pub auto_rollback: bool,
    /// Where last-known-good images are kept; `None` disables state tracking.
    pub state_dir: Option<PathBuf>,
}

fn tracked<T, E: std::fmt::Display>(
    log: &mut StageLog,
    stage: Stage,
    message: impl FnOnce(&T) -> Option<String>,
    run: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    log.start(stage);
    match run() {
        Ok(value) => {
            log.finish(stage, true, message(&value));
            Ok(value)
        }
        Err(err) => {
            log.finish(stage, false, Some(err.to_string()));
            Err(err)
        }
    }
}

fn execute(
    ctx: &mut DeploymentContext<'_>,
    desired: &DesiredRevision,
    options: &DeployOptions,
    log: &mut StageLog,
    checkout: &mut Option<Checkout>,
) -> Result<(), DeployError> {
    tracked(
        log,
        Stage::Provision,
        |_| None,
        || ensure_environment(ctx, options.provision),
    )?;
    let synced = tracked(
        log,
        Stage::Sync,
        |c: &Checkout| Some(c.revision.clone()),
        || sync_repository(ctx, desired),
    )?;
    let checkout = checkout.insert(synced);
    let summary = reconcile(ctx, checkout, options.reconcile, log)?;
    tracked(
        log,
        Stage::Verify,
        |observed: &Vec<_>| Some(format!("{} containers healthy", observed.len())),
        || verify(ctx, &summary.services, &options.health),
    )?;
    Ok(())
}

/// Reconciles and verifies an already confirmed checkout at `target`.
pub fn rollback_to(
    ctx: &mut DeploymentContext<'_>,
    checkout: &Checkout,
    target: ImageReference,
    options: &DeployOptions,
) -> RollbackOutcome {
    tracing::warn!(host = %ctx.host_ref, image = %target, "rolling back");
    let target_image = target.to_string();
    ctx.image = Some(target);
    let mut log = StageLog::new();
    let outcome = reconcile(ctx, checkout, options.reconcile, &mut log)
        .map_err(DeployError::from)
        .and_then(|summary| {
            tracked(
                &mut log,
                Stage::Verify,
                |_| None,
                || verify(ctx, &summary.services, &options.health),
            )
            .map_err(DeployError::from)
        });
    match outcome {
        Ok(_) => RollbackOutcome {
            target_image,
            succeeded: true,
            error: None,
            failing_services: Vec::new(),
            stages: log.into_records(),
        },
        Err(err) => RollbackOutcome {
            target_image,
            succeeded: false,
            error: Some(err.to_string()),
            failing_services: err.failing_services().to_vec(),
            stages: log.into_records(),
        },
    }
}

fn load_or_default(options: &DeployOptions) -> DeployState {
    let Some(dir) = &options.state_dir else {
        return DeployState::default();
    };
    load_state(dir).unwrap_or_else(|err| {
        tracing::warn!("ignoring unreadable deploy state: {err:#}");
        DeployState::default()
    })
}

fn persist(options: &DeployOptions, state: &DeployState) {
    if let Some(dir) = &options.state_dir {
        if let Err(err) = save_state(dir, state) {
            tracing::warn!("failed to save deploy state: {err:#}");
        }
    }
}

fn auto_rollback(
    ctx: &mut DeploymentContext<'_>,
    checkout: &Checkout,
    failed_image: Option<&str>,
    state: &DeployState,
    options: &DeployOptions,
) -> Option<RollbackOutcome> {
    let target = state.rollback_target(failed_image)?;
    match target.parse::<ImageReference>() {
        Ok(target) => Some(rollback_to(ctx, checkout, target, options)),
        Err(err) => {
            tracing::warn!(image = target, "stored rollback image is invalid: {err}");
            None
        }
    }
}

/// Prober, synchronizer, reconciler and verifier in order; the first failure ends
/// the run. Never fails itself: the outcome is in the returned result.
pub fn run_deploy(
    ctx: &mut DeploymentContext<'_>,
    desired: &DesiredRevision,
    options: &DeployOptions,
) -> DeploymentResult {
    ctx.image = desired.image.clone();
    let image_reference = desired.image.as_ref().map(ToString::to_string);
    let mut log = StageLog::new();
    let mut checkout = None;
    let outcome = execute(ctx, desired, options, &mut log, &mut checkout);
    let revision = checkout.as_ref().map(|c| c.revision.clone());

    let mut state = load_or_default(options);
    let mut result = DeploymentResult {
        succeeded: outcome.is_ok(),
        failing_services: Vec::new(),
        timestamp: Utc::now(),
        host: ctx.host_ref.clone(),
        failed_stage: None,
        error: None,
        exit_code: 0,
        revision: revision.clone(),
        image_reference: image_reference.clone(),
        stages: Vec::new(),
        rollback: None,
    };

    match outcome {
        Ok(()) => {
            let revision = revision.as_deref().unwrap_or_default();
            state.record_success(image_reference.as_deref(), revision);
        }
        Err(err) => {
            state.record_failure(image_reference.as_deref(), revision.as_deref());
            result.failed_stage = Some(err.stage());
            result.error = Some(err.to_string());
            result.exit_code = err.exit_code();
            result.failing_services = err.failing_services().to_vec();

            let is_health = matches!(
                err,
                DeployError::Health(
                    HealthError::UnhealthyServices { .. } | HealthError::IncompleteRollout { .. }
                )
            );
            if is_health && options.auto_rollback {
                if let Some(checkout) = &checkout {
                    result.rollback =
                        auto_rollback(ctx, checkout, image_reference.as_deref(), &state, options);
                }
            }
            if let Some(rollback) = result.rollback.as_ref().filter(|r| r.succeeded) {
                let revision = revision.as_deref().unwrap_or_default();
                state.record_rollback(&rollback.target_image, revision);
            }
        }
    }
    persist(options, &state);
    result.stages = log.into_records();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_settings;
    use crate::exec::testing::ScriptedExecutor;
    use crate::health::ServiceHealth;
    use std::time::Duration;

    const CONFIG: &str = r#"{"services": {"backend": {"image": "ghcr.io/acme/erp:v2"}, "frontend": {"image": "ghcr.io/acme/erp:v2"}}}"#;
    const PS: &str = "ps -a --format json";
    // The pre-reconcile snapshot also runs `ps -a`; keep it off the PS queue.
    const SNAPSHOT: &str = ".deployctl/backups";
    const HEALTHY: &str = "{\"Service\":\"backend\",\"State\":\"running\",\"Health\":\"healthy\"}\n{\"Service\":\"frontend\",\"State\":\"running\",\"Health\":\"\"}";
    const UNHEALTHY: &str = "{\"Service\":\"backend\",\"State\":\"running\",\"Health\":\"unhealthy\"}\n{\"Service\":\"frontend\",\"State\":\"running\",\"Health\":\"\"}";

    fn options(state_dir: &std::path::Path) -> DeployOptions {
        DeployOptions {
            provision: ProvisionPolicy {
                install_missing: true,
                use_sudo: false,
            },
            reconcile: ReconcilePolicy {
                settle: Duration::ZERO,
                prune_images: true,
            },
            health: HealthPolicy {
                timeout: Duration::ZERO,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                log_tail_lines: 20,
                excluded_services: Vec::new(),
            },
            auto_rollback: true,
            state_dir: Some(state_dir.to_path_buf()),
        }
    }

    fn desired(image: &str) -> DesiredRevision {
        DesiredRevision {
            repo_url: "https://github.com/acme/erp-deploy.git".to_string(),
            git_ref: None,
            image: Some(image.parse().unwrap()),
        }
    }

    fn deploy(exec: &mut ScriptedExecutor, image: &str, dir: &std::path::Path) -> DeploymentResult {
        let mut ctx = DeploymentContext::new(exec, "/srv/erp", test_settings(), None);
        run_deploy(&mut ctx, &desired(image), &options(dir))
    }

    #[test]
    fn network_failure_during_pull_stops_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .fail("docker-compose.yml pull", 1, "dial tcp: lookup ghcr.io: no such host");
        let result = deploy(&mut exec, "ghcr.io/acme/erp:v2", dir.path());

        assert!(!result.succeeded);
        assert_eq!(result.failed_stage, Some(Stage::Pull));
        assert_eq!(result.exit_code, 1);
        assert!(result.failing_services.is_empty());
        assert!(result.rollback.is_none());
        assert!(!exec.ran("down --remove-orphans"));
        assert!(!exec.ran("up -d"));

        let state = load_state(dir.path()).unwrap();
        assert!(state.current_image.is_none());
        assert!(!state.history[0].succeeded);
    }

    #[test]
    fn healthy_rollout_succeeds_and_becomes_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .ok("rev-parse HEAD", "abc123")
            .ok(PS, HEALTHY);
        let result = deploy(&mut exec, "ghcr.io/acme/erp:v2", dir.path());

        assert!(result.succeeded, "{:?}", result.error);
        assert!(result.failing_services.is_empty());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.revision.as_deref(), Some("abc123"));
        let stages: Vec<_> = result.stages.iter().map(|r| r.stage).collect();
        assert_eq!(stages.first(), Some(&Stage::Provision));
        assert_eq!(stages.last(), Some(&Stage::Verify));

        let state = load_state(dir.path()).unwrap();
        assert_eq!(state.current_image.as_deref(), Some("ghcr.io/acme/erp:v2"));
        assert_eq!(state.last_revision.as_deref(), Some("abc123"));
    }

    #[test]
    fn unhealthy_service_is_reported_with_its_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .ok(PS, UNHEALTHY)
            .ok("--tail 20 backend", "gunicorn: worker failed to boot");
        let result = deploy(&mut exec, "ghcr.io/acme/erp:v2", dir.path());

        assert!(!result.succeeded);
        assert_eq!(result.failed_stage, Some(Stage::Verify));
        assert_eq!(result.exit_code, 40);
        assert_eq!(result.failing_services.len(), 1);
        let backend = &result.failing_services[0];
        assert_eq!(backend.name, "backend");
        assert_eq!(backend.health, ServiceHealth::Unhealthy);
        assert_eq!(backend.log_tail, ["gunicorn: worker failed to boot"]);
        // Nothing known-good to return to.
        assert!(result.rollback.is_none());
    }

    #[test]
    fn unhealthy_rollout_rolls_back_to_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DeployState::default();
        state.record_success(Some("ghcr.io/acme/erp:v1"), "old");
        save_state(dir.path(), &state).unwrap();

        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .ok(PS, UNHEALTHY)
            .ok(PS, HEALTHY);
        let result = deploy(&mut exec, "ghcr.io/acme/erp:v2", dir.path());

        assert!(!result.succeeded);
        let rollback = result.rollback.expect("rollback attempted");
        assert!(rollback.succeeded, "{:?}", rollback.error);
        assert_eq!(rollback.target_image, "ghcr.io/acme/erp:v1");
        let failed_up = exec.position("CUSTOM_TAG=v2 docker compose -f docker-compose.yml up").unwrap();
        let restored_up = exec.position("CUSTOM_TAG=v1 docker compose -f docker-compose.yml up").unwrap();
        assert!(failed_up < restored_up);

        let state = load_state(dir.path()).unwrap();
        assert_eq!(state.current_image.as_deref(), Some("ghcr.io/acme/erp:v1"));
        assert_ne!(state.previous_image.as_deref(), Some("ghcr.io/acme/erp:v2"));
    }

    #[test]
    fn failed_redeploy_of_current_image_is_not_remembered_as_good() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DeployState::default();
        state.record_success(Some("ghcr.io/acme/erp:v1"), "old");
        state.record_success(Some("ghcr.io/acme/erp:v2"), "mid");
        save_state(dir.path(), &state).unwrap();

        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .ok(PS, UNHEALTHY)
            .ok(PS, HEALTHY);
        let result = deploy(&mut exec, "ghcr.io/acme/erp:v2", dir.path());
        let rollback = result.rollback.expect("rollback attempted");
        assert_eq!(rollback.target_image, "ghcr.io/acme/erp:v1");
        assert!(rollback.succeeded);

        let state = load_state(dir.path()).unwrap();
        assert_eq!(state.current_image.as_deref(), Some("ghcr.io/acme/erp:v1"));
        assert_eq!(state.rollback_target(None), None);
    }

    #[test]
    fn rollback_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DeployState::default();
        state.record_success(Some("ghcr.io/acme/erp:v1"), "old");
        save_state(dir.path(), &state).unwrap();

        let mut exec = ScriptedExecutor::new()
            .ok(SNAPSHOT, "")
            .ok("config --format json", CONFIG)
            .ok(PS, UNHEALTHY);
        let mut opts = options(dir.path());
        opts.auto_rollback = false;
        let result = {
            let mut ctx = DeploymentContext::new(&mut exec, "/srv/erp", test_settings(), None);
            run_deploy(&mut ctx, &desired("ghcr.io/acme/erp:v2"), &opts)
        };
        assert!(result.rollback.is_none());
        assert!(!exec.ran("CUSTOM_TAG=v1"));
    }
}
