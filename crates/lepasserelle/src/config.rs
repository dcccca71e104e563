// Relay Configuration
//
// *La Configuration* (The Configuration) - Settings for LeRelais runs

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use lephase::{Phase, PhaseConfig};
use lerapprochement::{DateRange, SequenceRange};
use lestockage::StorageConfig;
use letache::ControllerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = ".lerelais/config.toml";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RelaisConfig {
    /// Job state settings
    pub state: StateConfig,

    /// Store settings
    pub store: StoreConfig,

    /// Data source settings
    pub source: SourceConfig,

    /// Declared universe
    pub universe: UniverseConfig,

    /// Fetch pool settings
    pub pool: PoolSettings,

    /// Per-phase policies
    pub phases: PhasesConfig,
}

impl RelaisConfig {
    /// Load configuration from a directory
    ///
    /// Looks for `.lerelais/config.toml` in the project directory.
    /// If not found, returns default configuration.
    pub fn load<P: AsRef<Path>>(project_path: P) -> Result<Self> {
        let config_path = project_path.as_ref().join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            return Ok(RelaisConfig::default());
        }
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: RelaisConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a directory
    ///
    /// Creates `.lerelais` directory if it doesn't exist.
    pub fn save<P: AsRef<Path>>(&self, project_path: P) -> Result<()> {
        let config_path = project_path.as_ref().join(DEFAULT_CONFIG_FILE);
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let toml_string =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(&config_path, toml_string)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Reject settings no run can use
    pub fn validate(&self) -> Result<()> {
        if self.universe.first_sequence > self.universe.last_sequence {
            bail!(
                "universe.first_sequence ({}) is after universe.last_sequence ({})",
                self.universe.first_sequence,
                self.universe.last_sequence
            );
        }
        if let (Some(start), Some(end)) = (self.universe.season_start, self.universe.season_end) {
            if start > end {
                bail!("universe.season_start {} is after universe.season_end {}", start, end);
            }
        }
        for phase in &self.phases.enabled {
            if self.phases.get(*phase).workers == 0 {
                bail!("phases.{}.workers must be at least 1", phase);
            }
        }
        Ok(())
    }

    /// Controller settings rooted at `project_path`
    pub fn controller_config(&self, project_path: &Path) -> ControllerConfig {
        ControllerConfig {
            state_dir: resolve(project_path, &self.state.dir),
            cancel_grace: Duration::from_secs(self.state.cancel_grace_secs),
            poll_interval: Duration::from_millis(100),
            workdir: Some(project_path.to_path_buf()),
        }
    }

    /// Store settings rooted at `project_path`
    pub fn storage_config(&self, project_path: &Path) -> StorageConfig {
        StorageConfig {
            db_path: resolve(project_path, &self.store.db_path),
            wal_enabled: self.store.wal_enabled,
            busy_timeout_ms: self.store.busy_timeout_ms,
            ..StorageConfig::default()
        }
    }

    /// Checkpoint file of `job_name`'s workflow
    pub fn workflow_state_path(&self, project_path: &Path, job_name: &str) -> PathBuf {
        resolve(project_path, &self.state.dir)
            .join("workflows")
            .join(format!("{}.workflow.json", job_name))
    }

    /// Date range of a run: explicit bounds win, then the configured season,
    /// then the calendar year of `today`.
    pub fn date_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<DateRange> {
        let start = start
            .or(self.universe.season_start)
            .or_else(|| NaiveDate::from_ymd_opt(today.year(), 1, 1))
            .context("cannot determine start date")?;
        let end = end
            .or(self.universe.season_end)
            .or_else(|| NaiveDate::from_ymd_opt(today.year(), 12, 31))
            .context("cannot determine end date")?;
        DateRange::new(start, end).context("invalid date range")
    }

    /// Configured sequence numbers
    pub fn sequences(&self) -> Result<SequenceRange> {
        SequenceRange::new(self.universe.first_sequence, self.universe.last_sequence)
            .context("invalid sequence range")
    }

    /// Enabled phases in execution order with their policies
    pub fn phase_plan(&self) -> Vec<(Phase, PhaseConfig)> {
        Phase::ALL
            .into_iter()
            .filter(|p| self.phases.enabled.contains(p))
            .map(|p| (p, *self.phases.get(p)))
            .collect()
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Job state configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    /// Root of lock, progress, checkpoint and log files
    pub dir: PathBuf,

    /// Seconds a worker gets to exit after the terminate signal
    pub cancel_grace_secs: u64,

    /// Hours finished progress records stay visible
    pub progress_retention_hours: u64,

    /// Seconds a launched worker waits for the lock handoff
    pub handoff_wait_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".lerelais/state"),
            cancel_grace_secs: 10,
            progress_retention_hours: 24,
            handoff_wait_secs: 5,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub db_path: PathBuf,

    /// Whether to enable WAL mode
    pub wal_enabled: bool,

    /// How long a writer waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".lerelais/relais.db"),
            wal_enabled: true,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Data source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// URL with `{kind}`, `{facility}`, `{date}` and `{sequence}` placeholders
    pub url_template: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url_template: "http://127.0.0.1:8080/{kind}/{facility}/{date}/{sequence}".to_string(),
            request_timeout_secs: 30,
            user_agent: format!("lerelais/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Universe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UniverseConfig {
    /// Facility codes
    pub facilities: Vec<String>,

    /// First sequence number per facility and day
    pub first_sequence: u32,

    /// Last sequence number per facility and day
    pub last_sequence: u32,

    /// First day of the unrestricted range
    pub season_start: Option<NaiveDate>,

    /// Last day of the unrestricted range
    pub season_end: Option<NaiveDate>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            facilities: Vec::new(),
            first_sequence: 1,
            last_sequence: 12,
            season_start: None,
            season_end: None,
        }
    }
}

/// Fetch pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    /// Ceiling on one phase's pool run, in seconds
    pub timeout_secs: u64,

    /// Ceiling on one item, in seconds (0 disables)
    pub item_timeout_secs: u64,

    /// Items between progress pushes
    pub progress_every: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            item_timeout_secs: 120,
            progress_every: 10,
        }
    }
}

impl PoolSettings {
    /// Per-item ceiling, if enabled
    pub fn item_timeout(&self) -> Option<Duration> {
        (self.item_timeout_secs > 0).then(|| Duration::from_secs(self.item_timeout_secs))
    }
}

/// Per-phase configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhasesConfig {
    /// Phases to run
    pub enabled: Vec<Phase>,

    /// Programs phase policy
    pub programs: PhaseConfig,

    /// Results phase policy
    pub results: PhaseConfig,

    /// Odds phase policy
    pub odds: PhaseConfig,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            enabled: Phase::ALL.to_vec(),
            programs: Phase::Programs.default_config(),
            results: Phase::Results.default_config(),
            odds: Phase::Odds.default_config(),
        }
    }
}

impl PhasesConfig {
    /// Policy of `phase`
    pub fn get(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Programs => &self.programs,
            Phase::Results => &self.results,
            Phase::Odds => &self.odds,
        }
    }

    /// Mutable policy of `phase`
    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseConfig {
        match phase {
            Phase::Programs => &mut self.programs,
            Phase::Results => &mut self.results,
            Phase::Odds => &mut self.odds,
        }
    }
}
