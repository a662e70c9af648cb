use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::DEFAULT_SAMPLE_RATE;

pub const CONFIG_FILE_NAME: &str = "cadence.config.toml";
pub const CONFIG_PATH_ENV: &str = "CADENCE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    pub audio: AudioConfig,
    pub scheduling: SchedulingConfig,
    pub simulation: SimulationConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub default_volume_db: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Seconds between a graph's stop instant and the release of its nodes.
    pub teardown_margin_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub block_frames: usize,
    /// How late the offline driver fires wall timers.
    pub timer_jitter_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
    pub log_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            default_volume_db: 0.0,
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            teardown_margin_seconds: 0.05,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            block_frames: 256,
            timer_jitter_seconds: 0.0,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: "info,cadence_core=debug".to_string(),
            trace_file_prefix: "cadence".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PlayerConfig {
    pub fn load() -> Result<Self> {
        let config_path = discover_config_path().with_context(|| {
            format!("failed to locate {CONFIG_FILE_NAME}; looked in cwd and parent directory")
        })?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))
    }

    /// Like [`Self::load`], but a missing file yields the defaults. A file that exists and
    /// fails to parse is still an error.
    pub fn load_or_default() -> Result<Self> {
        match discover_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(error) => {
                debug!(%error, "no config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow::anyhow!("{CONFIG_FILE_NAME} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: PlayerConfig = toml::from_str(
            r#"
            [audio]
            sample_rate = 44100

            [simulation]
            timer_jitter_seconds = 0.02
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.simulation.block_frames, 256);
        assert_eq!(config.simulation.timer_jitter_seconds, 0.02);
        assert_eq!(config.scheduling.teardown_margin_seconds, 0.05);
        assert_eq!(config.diagnostics.trace_file_prefix, "cadence");
    }

    #[test]
    fn load_from_reports_parse_errors_with_the_path() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[audio]\nsample_rate = \"fast\"\n").expect("config should be written");

        let error = PlayerConfig::load_from(&path).expect_err("bad type should fail");
        assert!(format!("{error:#}").contains(CONFIG_FILE_NAME));
    }
}
