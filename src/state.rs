use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{MAX_HISTORY_ENTRIES, STATE_FILE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployState {
    pub current_image: Option<String>,
    pub previous_image: Option<String>,
    pub last_revision: Option<String>,
    #[serde(default)]
    pub history: Vec<DeployedRelease>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedRelease {
    pub image: Option<String>,
    pub revision: Option<String>,
    pub deployed_at: String,
    pub succeeded: bool,
}

pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}

pub fn load_state(state_dir: &Path) -> Result<DeployState> {
    let path = state_path(state_dir);
    if !path.exists() {
        return Ok(DeployState::default());
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read state at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse state at {}", path.display()))
}

pub fn save_state(state_dir: &Path, state: &DeployState) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
    let path = state_path(state_dir);
    let contents = serde_json::to_string_pretty(state)?;
    fs::write(&path, contents)
        .with_context(|| format!("Failed to write state at {}", path.display()))?;
    Ok(())
}

impl DeployState {
    /// The image a rollback should return to, if it differs from `current`.
    pub fn rollback_target(&self, current: Option<&str>) -> Option<&str> {
        let candidate = match current {
            Some(current) if self.current_image.as_deref() != Some(current) => {
                self.current_image.as_deref()
            }
            _ => self.previous_image.as_deref(),
        }?;
        (Some(candidate) != current).then_some(candidate)
    }

    /// Records a healthy rollout. Redeploying the current image keeps `previous_image`.
    pub fn record_success(&mut self, image: Option<&str>, revision: &str) {
        if let Some(image) = image {
            if self.current_image.as_deref() != Some(image) {
                self.previous_image = self.current_image.take();
                self.current_image = Some(image.to_string());
            }
        }
        self.last_revision = Some(revision.to_string());
        self.push_history(image, Some(revision), true);
    }

    /// Records a healthy rollback to `image`. The image rolled away from is not
    /// remembered as a rollback target.
    pub fn record_rollback(&mut self, image: &str, revision: &str) {
        if self.previous_image.as_deref() == Some(image) {
            self.previous_image = None;
        }
        self.current_image = Some(image.to_string());
        self.last_revision = Some(revision.to_string());
        self.push_history(Some(image), Some(revision), true);
    }

    pub fn record_failure(&mut self, image: Option<&str>, revision: Option<&str>) {
        self.push_history(image, revision, false);
    }

    fn push_history(&mut self, image: Option<&str>, revision: Option<&str>, succeeded: bool) {
        self.history.push(DeployedRelease {
            image: image.map(str::to_string),
            revision: revision.map(str::to_string),
            deployed_at: Utc::now().to_rfc3339(),
            succeeded,
        });
        if self.history.len() > MAX_HISTORY_ENTRIES {
            let excess = self.history.len() - MAX_HISTORY_ENTRIES;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_state(dir.path()).unwrap();
        assert_eq!(state, DeployState::default());
    }

    #[test]
    fn success_shifts_current_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DeployState::default();
        state.record_success(Some("ghcr.io/acme/erp:v1"), "aaa");
        state.record_success(Some("ghcr.io/acme/erp:v2"), "bbb");
        state.record_success(Some("ghcr.io/acme/erp:v2"), "ccc");
        save_state(dir.path(), &state).unwrap();

        let loaded = load_state(dir.path()).unwrap();
        assert_eq!(loaded.current_image.as_deref(), Some("ghcr.io/acme/erp:v2"));
        assert_eq!(loaded.previous_image.as_deref(), Some("ghcr.io/acme/erp:v1"));
        assert_eq!(loaded.last_revision.as_deref(), Some("ccc"));
        assert_eq!(loaded.history.len(), 3);
    }

    #[test]
    fn rollback_target_skips_the_failing_image() {
        let mut state = DeployState::default();
        assert_eq!(state.rollback_target(Some("erp:v3")), None);

        state.record_success(Some("erp:v1"), "aaa");
        state.record_success(Some("erp:v2"), "bbb");
        // A new image failed: go back to what was running.
        assert_eq!(state.rollback_target(Some("erp:v3")), Some("erp:v2"));
        // The current image itself failed: go back one further.
        assert_eq!(state.rollback_target(Some("erp:v2")), Some("erp:v1"));
        assert_eq!(state.rollback_target(None), Some("erp:v1"));
    }

    #[test]
    fn rollback_never_makes_the_failed_image_a_target() {
        let mut state = DeployState::default();
        state.record_success(Some("erp:v1"), "aaa");
        state.record_success(Some("erp:v2"), "bbb");

        // Redeploying v2 at a new revision turned unhealthy.
        let target = state.rollback_target(Some("erp:v2")).map(str::to_string);
        assert_eq!(target.as_deref(), Some("erp:v1"));
        state.record_rollback("erp:v1", "ccc");

        assert_eq!(state.current_image.as_deref(), Some("erp:v1"));
        assert_eq!(state.previous_image, None);
        assert_eq!(state.rollback_target(None), None);
        assert!(state.history.last().unwrap().succeeded);
    }

    #[test]
    fn rollback_from_a_new_image_keeps_the_older_target() {
        let mut state = DeployState::default();
        state.record_success(Some("erp:v1"), "aaa");
        state.record_success(Some("erp:v2"), "bbb");
        state.record_rollback("erp:v2", "bbb");
        assert_eq!(state.current_image.as_deref(), Some("erp:v2"));
        assert_eq!(state.rollback_target(None), Some("erp:v1"));
    }

    #[test]
    fn history_is_capped() {
        let mut state = DeployState::default();
        for n in 0..(MAX_HISTORY_ENTRIES + 7) {
            state.record_failure(Some(&format!("erp:{n}")), None);
        }
        assert_eq!(state.history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(state.history[0].image.as_deref(), Some("erp:7"));
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(state_path(dir.path()), "{not json").unwrap();
        let err = load_state(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse state"));
    }
}
