use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::compose::{total_replicas, ServiceSpec};
use crate::context::DeploymentContext;
use crate::error::HealthError;
use crate::exec::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Exited,
    Restarting,
    Unknown,
}

impl ServiceState {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" => Self::Exited,
            "restarting" => Self::Restarting,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl ServiceHealth {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "starting" => Self::Starting,
            _ => Self::None,
        }
    }
}

/// One container as the runtime reports it on a single poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedService {
    pub name: String,
    pub state: ServiceState,
    pub health: ServiceHealth,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub log_tail_lines: usize,
    /// One-shot services (migrations, configurators) that are expected to exit.
    pub excluded_services: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    service: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
}

impl From<PsEntry> for ObservedService {
    fn from(entry: PsEntry) -> Self {
        Self {
            name: entry.service,
            state: ServiceState::parse(&entry.state),
            health: ServiceHealth::parse(&entry.health),
            log_tail: Vec::new(),
        }
    }
}

/// Parses `compose ps --format json`: a JSON array on older compose v2 releases,
/// one object per line on newer ones.
pub fn parse_ps_output(raw: &str) -> Result<Vec<ObservedService>, HealthError> {
    let raw = raw.trim();
    let entries: Vec<PsEntry> = if raw.is_empty() {
        Vec::new()
    } else if raw.starts_with('[') {
        serde_json::from_str(raw).map_err(|err| HealthError::Query(err.to_string()))?
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str::<PsEntry>)
            .collect::<Result<_, _>>()
            .map_err(|err| HealthError::Query(err.to_string()))?
    };
    let mut observed: Vec<ObservedService> = entries.into_iter().map(Into::into).collect();
    observed.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(observed)
}

pub fn observe(ctx: &mut DeploymentContext<'_>) -> Result<Vec<ObservedService>, HealthError> {
    let output = ctx.run(&ctx.compose_command("ps -a --format json"))?;
    if !output.ok {
        return Err(HealthError::Query(format!(
            "exit {}: {}",
            output.returncode,
            output.detail()
        )));
    }
    parse_ps_output(&output.stdout)
}

/// Compares one poll against the expected services.
fn evaluate(
    expected: &[ServiceSpec],
    observed: Vec<ObservedService>,
) -> Result<Vec<ObservedService>, HealthError> {
    let unhealthy: Vec<ObservedService> = observed
        .iter()
        .filter(|svc| svc.health == ServiceHealth::Unhealthy)
        .cloned()
        .collect();
    if !unhealthy.is_empty() {
        return Err(HealthError::UnhealthyServices {
            services: unhealthy,
        });
    }

    let expected_total = total_replicas(expected);
    let running = observed
        .iter()
        .filter(|svc| svc.state == ServiceState::Running)
        .count();
    if running != expected_total {
        let mut implicated: Vec<ObservedService> = observed
            .iter()
            .filter(|svc| svc.state != ServiceState::Running)
            .cloned()
            .collect();
        for spec in expected {
            if !observed.iter().any(|svc| svc.name == spec.name) {
                implicated.push(ObservedService {
                    name: spec.name.clone(),
                    state: ServiceState::Unknown,
                    health: ServiceHealth::None,
                    log_tail: Vec::new(),
                });
            }
        }
        return Err(HealthError::IncompleteRollout {
            expected: expected_total,
            actual: running,
            services: implicated,
        });
    }

    // Healthcheck still in its start period: not a verdict yet.
    let starting: Vec<ObservedService> = observed
        .iter()
        .filter(|svc| svc.health == ServiceHealth::Starting)
        .cloned()
        .collect();
    if !starting.is_empty() {
        return Err(HealthError::UnhealthyServices { services: starting });
    }
    Ok(observed)
}

fn check_once(
    ctx: &mut DeploymentContext<'_>,
    expected: &[ServiceSpec],
    policy: &HealthPolicy,
) -> Result<Vec<ObservedService>, HealthError> {
    let excluded = |name: &str| policy.excluded_services.iter().any(|s| s == name);
    let observed = observe(ctx)?
        .into_iter()
        .filter(|svc| !excluded(svc.name.as_str()))
        .collect();
    let expected: Vec<ServiceSpec> = expected
        .iter()
        .filter(|spec| !excluded(spec.name.as_str()))
        .cloned()
        .collect();
    evaluate(&expected, observed)
}

fn log_tail(ctx: &mut DeploymentContext<'_>, service: &str, lines: usize) -> Vec<String> {
    let command = ctx.compose_command(&format!(
        "logs --no-color --tail {lines} {}",
        shell_quote(service)
    ));
    match ctx.run(&command) {
        Ok(output) if output.ok => {
            let all: Vec<&str> = output.stdout.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].iter().map(|line| line.to_string()).collect()
        }
        Ok(output) => {
            tracing::warn!(service, exit = output.returncode, "could not collect logs");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!(service, "could not collect logs: {err:#}");
            Vec::new()
        }
    }
}

fn collect_logs(
    ctx: &mut DeploymentContext<'_>,
    mut services: Vec<ObservedService>,
    lines: usize,
) -> Vec<ObservedService> {
    let mut tails: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for svc in &mut services {
        let tail = match tails.get(&svc.name) {
            Some(tail) => tail.clone(),
            None => {
                let tail = log_tail(ctx, &svc.name, lines);
                tails.insert(svc.name.clone(), tail.clone());
                tail
            }
        };
        svc.log_tail = tail;
    }
    services
}

fn attach_logs(ctx: &mut DeploymentContext<'_>, err: HealthError, lines: usize) -> HealthError {
    match err {
        HealthError::UnhealthyServices { services } => HealthError::UnhealthyServices {
            services: collect_logs(ctx, services, lines),
        },
        HealthError::IncompleteRollout {
            expected,
            actual,
            services,
        } => HealthError::IncompleteRollout {
            expected,
            actual,
            services: collect_logs(ctx, services, lines),
        },
        other => other,
    }
}

/// Polls the stack until it matches `expected` or the deadline passes.
///
/// The delay between polls starts at `initial_backoff` and doubles up to
/// `max_backoff`. A zero timeout makes exactly one poll. On failure the implicated
/// services carry their recent log lines.
pub fn verify(
    ctx: &mut DeploymentContext<'_>,
    expected: &[ServiceSpec],
    policy: &HealthPolicy,
) -> Result<Vec<ObservedService>, HealthError> {
    // A timeout past what `Instant` can represent means no deadline.
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut delay = policy.initial_backoff;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match check_once(ctx, expected, policy) {
            Ok(observed) => {
                tracing::info!(
                    host = %ctx.host_ref,
                    attempt,
                    containers = observed.len(),
                    "all services running and healthy"
                );
                return Ok(observed);
            }
            Err(HealthError::Transport(err)) => return Err(HealthError::Transport(err)),
            Err(err) => err,
        };

        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        };
        if remaining.is_zero() {
            tracing::warn!(host = %ctx.host_ref, attempt, "health verification gave up: {err}");
            return Err(attach_logs(ctx, err, policy.log_tail_lines));
        }
        let wait = delay.min(remaining);
        tracing::info!(attempt, wait_ms = wait.as_millis() as u64, "stack not ready: {err}");
        std::thread::sleep(wait);
        delay = delay.saturating_mul(2).min(policy.max_backoff);
    }
}
