use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// One service the compose configuration asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub expected_replica_count: usize,
    pub image_reference: Option<String>,
}

pub fn total_replicas(specs: &[ServiceSpec]) -> usize {
    specs.iter().map(|spec| spec.expected_replica_count).sum()
}

/// Parses `compose config --format json`. Services scaled to zero are dropped since
/// nothing of theirs is expected to run.
pub fn parse_config_json(raw: &str) -> Result<Vec<ServiceSpec>> {
    let json: JsonValue =
        serde_json::from_str(raw.trim()).context("compose config output is not valid JSON")?;
    let services = json
        .get("services")
        .and_then(JsonValue::as_object)
        .context("compose config has no services")?;

    let mut specs = Vec::with_capacity(services.len());
    for (name, service) in services {
        let replicas = service
            .get("deploy")
            .and_then(|deploy| deploy.get("replicas"))
            .or_else(|| service.get("scale"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(1) as usize;
        if replicas == 0 {
            continue;
        }
        specs.push(ServiceSpec {
            name: name.clone(),
            expected_replica_count: replicas,
            image_reference: service
                .get("image")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        });
    }
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}

/// Fallback for compose versions without JSON config output: one line per service.
pub fn parse_service_names(raw: &str) -> Vec<ServiceSpec> {
    let mut specs: Vec<ServiceSpec> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|name| ServiceSpec {
            name: name.to_string(),
            expected_replica_count: 1,
            image_reference: None,
        })
        .collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
}
