use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One app baked into the custom image by the image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppSource {
    pub url: String,
    pub branch: String,
}

fn has_known_scheme(url: &str) -> bool {
    if ["https://", "http://", "ssh://", "git://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len())
    {
        return true;
    }
    // scp-like: git@github.com:org/repo.git
    match url.split_once(':') {
        Some((host, path)) => {
            !host.is_empty() && !host.contains('/') && !path.is_empty() && !path.starts_with("//")
        }
        None => false,
    }
}

pub fn validate_apps(apps: &[AppSource]) -> Result<()> {
    if apps.is_empty() {
        bail!("App manifest is empty");
    }
    let mut seen = HashSet::new();
    for (index, app) in apps.iter().enumerate() {
        let url = app.url.trim();
        if url.is_empty() {
            bail!("App #{index} has an empty url");
        }
        if url.chars().any(char::is_whitespace) || !has_known_scheme(url) {
            bail!("App #{index} has an unsupported url: {url}");
        }
        let branch = app.branch.trim();
        if branch.is_empty() {
            bail!("App {url} has an empty branch");
        }
        if branch.chars().any(char::is_whitespace) {
            bail!("App {url} has an invalid branch: {branch}");
        }
        let key = url.trim_end_matches('/').trim_end_matches(".git");
        if !seen.insert(key.to_string()) {
            bail!("App {url} is listed more than once");
        }
    }
    Ok(())
}

/// Compact JSON of the manifest, base64 encoded (the `APPS_JSON_BASE64` build arg).
pub fn encode_apps(apps: &[AppSource]) -> Result<String> {
    validate_apps(apps)?;
    let json = serde_json::to_string(apps)?;
    Ok(STANDARD.encode(json))
}

pub fn load_apps(path: &Path) -> Result<Vec<AppSource>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read app manifest at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse app manifest at {}", path.display()))
}
