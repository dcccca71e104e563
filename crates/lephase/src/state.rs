use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::phase::Phase;
use crate::{Result, WorkflowError};

/// Current on-disk format of workflow state files.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Checkpoint of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    /// Phase this entry tracks.
    pub phase: Phase,
    /// Set once the phase's pool drained, errors included.
    pub completed: bool,
    /// Counters of the latest attempt (`universe`, `missing`, `processed`,
    /// `errored`, `skipped`).
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl PhaseState {
    /// Fresh, incomplete entry.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            completed: false,
            counters: BTreeMap::new(),
        }
    }

    /// Read one counter, 0 when absent.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Set one counter.
    pub fn set_counter(&mut self, name: &str, value: u64) {
        self.counters.insert(name.to_string(), value);
    }
}

/// Persisted progress of a phased workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Format version.
    pub schema_version: u32,
    /// Phases in execution order.
    pub phases: Vec<PhaseState>,
    /// Last save.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state over `phases`.
    pub fn new(phases: &[Phase]) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            phases: phases.iter().copied().map(PhaseState::new).collect(),
            updated_at: Utc::now(),
        }
    }

    /// Entry of `phase`.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Mutable entry of `phase`, created if missing.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseState {
        let idx = match self.phases.iter().position(|p| p.phase == phase) {
            Some(idx) => idx,
            None => {
                self.phases.push(PhaseState::new(phase));
                self.phases.len() - 1
            }
        };
        &mut self.phases[idx]
    }

    /// Whether `phase` finished in an earlier attempt.
    pub fn is_completed(&self, phase: Phase) -> bool {
        self.phase(phase).map(|p| p.completed).unwrap_or(false)
    }

    /// First phase still to run.
    pub fn first_incomplete(&self) -> Option<Phase> {
        self.phases.iter().find(|p| !p.completed).map(|p| p.phase)
    }

    /// True once every phase completed.
    pub fn is_done(&self) -> bool {
        self.first_incomplete().is_none()
    }

    /// Persist state to JSON file, replacing the previous checkpoint
    /// atomically.
    pub fn save_to_path(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.updated_at = Utc::now();

        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load state from JSON file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let state: Self = serde_json::from_slice(&bytes)?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(WorkflowError::UnsupportedSchema {
                found: state.schema_version,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        Ok(state)
    }

    /// State to run with: the saved checkpoint when resuming and one exists,
    /// otherwise a fresh one. Phases missing from the checkpoint are added,
    /// phases no longer configured are dropped.
    pub fn load_or_new(path: &Path, phases: &[Phase], resume: bool) -> Result<Self> {
        if !resume || !path.exists() {
            return Ok(Self::new(phases));
        }

        let saved = Self::load_from_path(path)?;
        let mut state = Self::new(phases);
        for entry in &mut state.phases {
            if let Some(prev) = saved.phase(entry.phase) {
                *entry = prev.clone();
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_roundtrip_save_and_load() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("nightly.workflow.json");

        let mut state = WorkflowState::new(&Phase::ALL);
        state.phase_mut(Phase::Programs).completed = true;
        state.phase_mut(Phase::Programs).set_counter("processed", 40);
        state.save_to_path(&file).expect("save state");

        let loaded = WorkflowState::load_from_path(&file).expect("load state");
        assert!(loaded.is_completed(Phase::Programs));
        assert_eq!(loaded.first_incomplete(), Some(Phase::Results));
        assert_eq!(loaded.phase(Phase::Programs).unwrap().counter("processed"), 40);
    }

    #[test]
    fn loading_missing_state_returns_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing.json");

        let err = WorkflowState::load_from_path(&missing)
            .err()
            .expect("must fail");
        assert!(matches!(err, WorkflowError::Io(_)));
    }

    #[test]
    fn fresh_run_ignores_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        let mut state = WorkflowState::new(&Phase::ALL);
        state.phase_mut(Phase::Programs).completed = true;
        state.save_to_path(&file).unwrap();

        let fresh = WorkflowState::load_or_new(&file, &Phase::ALL, false).unwrap();
        assert_eq!(fresh.first_incomplete(), Some(Phase::Programs));

        let resumed = WorkflowState::load_or_new(&file, &Phase::ALL, true).unwrap();
        assert_eq!(resumed.first_incomplete(), Some(Phase::Results));
    }

    #[test]
    fn resume_follows_configured_phases() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        let mut state = WorkflowState::new(&[Phase::Results]);
        state.phase_mut(Phase::Results).completed = true;
        state.save_to_path(&file).unwrap();

        let resumed =
            WorkflowState::load_or_new(&file, &[Phase::Results, Phase::Odds], true).unwrap();
        assert_eq!(resumed.phases.len(), 2);
        assert_eq!(resumed.first_incomplete(), Some(Phase::Odds));
    }

    #[test]
    fn future_schema_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        let mut state = WorkflowState::new(&Phase::ALL);
        state.schema_version = STATE_SCHEMA_VERSION + 1;
        std::fs::write(&file, serde_json::to_vec(&state).unwrap()).unwrap();

        assert!(matches!(
            WorkflowState::load_from_path(&file),
            Err(WorkflowError::UnsupportedSchema { .. })
        ));
    }
}
