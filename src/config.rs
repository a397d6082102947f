//! Rig and merge queue configuration.
//!
//! Per-rig settings live in `<rig>/config.json`. Every field is optional;
//! a missing file, a missing `merge_queue` section or a missing field all
//! fall back to the defaults below. Durations are written the humantime way
//! (`"30s"`, `"5m"`, `"1h 30m"`).
//!
//! Process-level settings (where the rig lives, where to listen) come from
//! the environment; see [`Settings::from_env`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slot::SlotBackoff;

const CONFIG_FILE: &str = "config.json";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7070";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// What to do when an MR conflicts with its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Hand the conflict back to a worker through a resolution task.
    #[default]
    AssignBack,
    /// Reserved. Escalates like [`OnConflict::AssignBack`].
    AutoRebase,
}

/// Merge queue settings for one rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeQueueConfig {
    pub enabled: bool,
    pub on_conflict: OnConflict,
    pub run_tests: bool,
    /// Shell command run in the worktree before merging. Empty skips tests.
    pub test_command: String,
    pub delete_merged_branches: bool,
    /// Test attempts per MR. Zero is treated as one.
    pub retry_flaky_tests: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_concurrent: u32,
    /// How long a claim may go without record updates before it is abandoned.
    #[serde(with = "humantime_serde")]
    pub stale_claim_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub test_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub git_timeout: Duration,
    pub slot_max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub slot_initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub slot_max_backoff: Duration,
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        MergeQueueConfig {
            enabled: true,
            on_conflict: OnConflict::AssignBack,
            run_tests: true,
            test_command: String::new(),
            delete_merged_branches: true,
            retry_flaky_tests: 1,
            poll_interval: Duration::from_secs(30),
            max_concurrent: 1,
            stale_claim_timeout: Duration::from_secs(30 * 60),
            test_timeout: Duration::from_secs(30 * 60),
            git_timeout: Duration::from_secs(5 * 60),
            slot_max_retries: SlotBackoff::DEFAULT.max_retries,
            slot_initial_backoff: SlotBackoff::DEFAULT.initial_delay,
            slot_max_backoff: SlotBackoff::DEFAULT.max_delay,
        }
    }
}

impl MergeQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stale_claim_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "stale_claim_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn slot_backoff(&self) -> SlotBackoff {
        SlotBackoff::new(
            self.slot_max_retries,
            self.slot_initial_backoff,
            self.slot_max_backoff,
        )
    }

    /// Number of test attempts to make.
    pub fn test_attempts(&self) -> u32 {
        self.retry_flaky_tests.max(1)
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_issue_prefix() -> String {
    "gt".to_string()
}

/// Contents of `<rig>/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigConfig {
    /// Rig name. Defaults to the rig directory's name.
    #[serde(default)]
    pub name: String,
    /// The protected branch whose pushes are guarded by the merge slot.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Prefix for IDs minted by the file-backed issue store.
    #[serde(default = "default_issue_prefix")]
    pub issue_prefix: String,
    #[serde(default)]
    pub merge_queue: MergeQueueConfig,
}

impl RigConfig {
    pub fn new(name: impl Into<String>) -> Self {
        RigConfig {
            name: name.into(),
            default_branch: default_branch(),
            issue_prefix: default_issue_prefix(),
            merge_queue: MergeQueueConfig::default(),
        }
    }

    /// Loads the rig's config, falling back to defaults if the file is absent.
    pub fn load(rig_path: &Path) -> Result<Self> {
        let dir_name = rig_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rig".to_string());

        let path = rig_path.join(CONFIG_FILE);
        let mut config = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<RigConfig>(&bytes)
                .map_err(|source| ConfigError::Parse { path, source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RigConfig::new(""),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        if config.name.is_empty() {
            config.name = dir_name;
        }
        config.merge_queue.validate()?;
        Ok(config)
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `REFINERY_RIG_PATH`; defaults to the current directory.
    pub rig_path: PathBuf,
    /// `REFINERY_LISTEN_ADDR`; defaults to `127.0.0.1:7070`.
    pub listen_addr: SocketAddr,
    /// `REFINERY_WORKDIR`; defaults to [`Settings::default_workdir`].
    pub workdir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rig_path = lookup("REFINERY_RIG_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let listen_addr = match lookup("REFINERY_LISTEN_ADDR").filter(|s| !s.is_empty()) {
            Some(value) => value.parse().map_err(|_| ConfigError::Env {
                var: "REFINERY_LISTEN_ADDR",
                value,
            })?,
            None => DEFAULT_LISTEN_ADDR.parse().map_err(|_| ConfigError::Env {
                var: "REFINERY_LISTEN_ADDR",
                value: DEFAULT_LISTEN_ADDR.to_string(),
            })?,
        };

        let workdir = lookup("REFINERY_WORKDIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_workdir(&rig_path));

        Ok(Settings {
            rig_path,
            listen_addr,
            workdir,
        })
    }

    /// The refinery's worktree: `<rig>/refinery/rig`, or `<rig>/mayor/rig`
    /// for rigs laid out before the refinery had its own clone.
    pub fn default_workdir(rig_path: &Path) -> PathBuf {
        let refinery = rig_path.join("refinery").join("rig");
        if refinery.exists() {
            refinery
        } else {
            rig_path.join("mayor").join("rig")
        }
    }

    /// State owned by the refinery itself (issue store, mailboxes).
    pub fn state_dir(&self) -> PathBuf {
        self.rig_path.join(".refinery")
    }
}
