//! Configuration management for Phrasecut.
//!
//! This module provides configuration loading, saving, and defaults.
//! Configuration is stored in TOML format in a platform-appropriate location.

use crate::error::{PhrasecutError, Result};
use crate::matcher::MatchOptions;
use crate::render::{Quality, DEFAULT_CLIP_PADDING, DEFAULT_HARDWARE_SLOTS};
use crate::types::SilenceConstraint;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure for Phrasecut.
///
/// ## Example Configuration File (phrasecut.toml)
///
/// ```toml
/// [general]
/// log_level = "info"
/// output_dir = "/srv/clips"
///
/// [search]
/// max_results_per_segment = 25
/// min_silence = 0.0
/// max_silence = 10.0
/// silence_word_threshold = 2
///
/// [render]
/// hardware_encoder = "h264_nvenc"
/// hardware_args = ["-preset", "p4"]
/// hardware_slots = 2
///
/// [merge]
/// target_fps = 30
/// crf = 18
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Search request defaults
    pub search: SearchConfig,

    /// Clip rendering
    pub render: RenderConfig,

    /// Timeline merging
    pub merge: MergeConfig,
}

/// General configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Where rendered clips go (None = `<data dir>/clips`)
    pub output_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_level: "info".to_string(),
            output_dir: None,
        }
    }
}

/// Defaults applied to search requests that leave a field unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Cap on candidates per result bucket
    pub max_results_per_segment: usize,

    /// Shortest accepted pause after a short match, seconds
    pub min_silence: f64,

    /// Longest accepted pause after a short match, seconds
    pub max_silence: f64,

    /// Matches with at most this many words must pass the pause check
    pub silence_word_threshold: usize,

    /// Shortest sub-window in partial mode
    pub partial_min_words: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_results_per_segment: 25,
            min_silence: 0.0,
            max_silence: 10.0,
            silence_word_threshold: 2,
            partial_min_words: 3,
        }
    }
}

/// Clip rendering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,

    /// Hardware video encoder (None = software only)
    pub hardware_encoder: Option<String>,

    /// Extra arguments passed after the hardware encoder
    pub hardware_args: Vec<String>,

    /// Concurrent hardware encodes across the whole process
    pub hardware_slots: usize,

    /// Render workers per result bucket (0 = available parallelism)
    pub workers: usize,

    /// Padding around search matches, seconds
    pub clip_padding_sec: f64,

    /// Frame rate of preview clips
    pub default_fps: f64,

    /// Per-invocation timeout for the external tools
    pub timeout_sec: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            hardware_encoder: None,
            hardware_args: Vec::new(),
            hardware_slots: DEFAULT_HARDWARE_SLOTS,
            workers: 0,
            clip_padding_sec: DEFAULT_CLIP_PADDING,
            default_fps: 25.0,
            timeout_sec: 300,
        }
    }
}

/// Timeline merge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub target_fps: u32,
    pub crf: u8,
    pub audio_bitrate: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            target_fps: 30,
            crf: 18,
            audio_bitrate: "192k".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| PhrasecutError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;

        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| PhrasecutError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "phrasecut").ok_or_else(|| PhrasecutError::ConfigError {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(dirs.config_dir().join("phrasecut.toml"))
    }

    /// Get the default data directory path.
    pub fn default_data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "phrasecut").ok_or_else(|| PhrasecutError::ConfigError {
            reason: "Could not determine data directory".to_string(),
        })?;

        Ok(dirs.data_dir().to_path_buf())
    }

    /// Get the clip output directory (from config or default).
    pub fn output_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.general.output_dir {
            Ok(path.clone())
        } else {
            Ok(Self::default_data_dir()?.join("clips"))
        }
    }

    /// Render workers per bucket with `0` resolved to the machine's parallelism.
    pub fn render_workers(&self) -> usize {
        match self.render.workers {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        }
    }

    /// Pause filter from the `[search]` defaults
    pub fn silence_constraint(&self) -> SilenceConstraint {
        SilenceConstraint::new(
            self.search.min_silence,
            self.search.max_silence,
            self.search.silence_word_threshold,
        )
    }

    /// Matcher tuning from the `[search]` defaults
    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            silence: self.silence_constraint(),
            max_results: self.search.max_results_per_segment,
        }
    }

    /// Quality profile for search and render clips
    pub fn preview_quality(&self) -> Quality {
        Quality::Preview {
            fps: self.render.default_fps,
        }
    }

    /// Quality profile for merge clips
    pub fn master_quality(&self) -> Quality {
        Quality::Master {
            fps: self.merge.target_fps,
            crf: self.merge.crf,
            audio_bitrate: self.merge.audio_bitrate.clone(),
        }
    }
}
