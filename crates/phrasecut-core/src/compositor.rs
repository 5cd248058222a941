//! Timeline compositing.
//!
//! Renders the enabled entries of a timeline one after another and joins the
//! results with the transcoder's concat facility. Entries render strictly in
//! sequence; a single merge never holds more than one encode slot.
//!
//! On failure the merge stops and the per-clip files produced so far stay on
//! disk for inspection or a retry.

use crate::cancel::CancelToken;
use crate::error::{PhrasecutError, Result};
use crate::render::{clamp_speed, ClipRenderer, RenderJob};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Longest name part of a merged file
const MAX_NAME_CHARS: usize = 100;

/// Title words used to name a merged file
const NAME_WORDS: usize = 5;

/// Where an entry's footage comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClipSource {
    /// A clip rendered earlier, optionally remembering where it was cut from
    Rendered {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ClipOrigin>,
    },

    /// A window of an original source file
    Source(ClipOrigin),
}

/// Original, untrimmed boundaries of a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipOrigin {
    pub file: PathBuf,
    pub original_start: f64,
    pub original_end: f64,
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    #[serde(default)]
    pub title: String,
    pub clip: ClipSource,
    #[serde(default)]
    pub start_trim_ms: i64,
    #[serde(default)]
    pub end_trim_ms: i64,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_speed() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl TimelineEntry {
    pub fn rendered(title: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        TimelineEntry {
            title: title.into(),
            clip: ClipSource::Rendered {
                path: path.into(),
                origin: None,
            },
            start_trim_ms: 0,
            end_trim_ms: 0,
            speed: 1.0,
            enabled: true,
        }
    }

    pub fn source(title: impl Into<String>, file: impl Into<PathBuf>, start: f64, end: f64) -> Self {
        TimelineEntry {
            title: title.into(),
            clip: ClipSource::Source(ClipOrigin {
                file: file.into(),
                original_start: start,
                original_end: end,
            }),
            start_trim_ms: 0,
            end_trim_ms: 0,
            speed: 1.0,
            enabled: true,
        }
    }

    /// True when the entry can be concatenated without rendering
    pub fn is_ready(&self) -> bool {
        matches!(self.clip, ClipSource::Rendered { .. })
            && self.start_trim_ms == 0
            && self.end_trim_ms == 0
            && clamp_speed(self.speed) == 1.0
    }
}

/// Stage of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStage {
    Preparing,
    Rendering,
    Rendered,
    Concatenating,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeProgress {
    pub stage: MergeStage,

    /// Entries finished so far
    pub index: usize,
    pub total: usize,
    pub message: String,
}

/// Result of a finished merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub output: PathBuf,

    /// Per-entry files that were joined, in order
    pub parts: Vec<PathBuf>,
}

/// Sequential renderer + concatenator for timelines.
pub struct Compositor {
    renderer: ClipRenderer,
}

impl Compositor {
    /// `renderer` should carry the master quality profile.
    pub fn new(renderer: ClipRenderer) -> Self {
        Compositor { renderer }
    }

    /// Render and join the enabled entries into a file inside `output_dir`.
    ///
    /// Fails with [`PhrasecutError::InvalidInput`] when no entry is enabled.
    /// A cancelled merge stops before the next entry and returns
    /// `Ok(None)`.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub fn merge(
        &self,
        entries: &[TimelineEntry],
        output_dir: &Path,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(MergeProgress),
    ) -> Result<Option<MergeOutcome>> {
        let enabled: Vec<&TimelineEntry> = entries.iter().filter(|e| e.enabled).collect();
        if enabled.is_empty() {
            return Err(PhrasecutError::invalid_input("no enabled timeline entries"));
        }
        let total = enabled.len();

        let output = output_dir.join(merged_file_name(
            &enabled.iter().map(|e| e.title.as_str()).collect::<Vec<_>>(),
        ));
        let parts_dir = output.with_extension("parts");
        std::fs::create_dir_all(&parts_dir)?;
        let renderer = self.renderer.with_output_dir(&parts_dir);

        on_progress(MergeProgress {
            stage: MergeStage::Preparing,
            index: 0,
            total,
            message: format!("Preparing {} clips", total),
        });

        let mut parts = Vec::with_capacity(total);
        for (i, entry) in enabled.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(done = i, total, "Merge cancelled");
                return Ok(None);
            }

            let label = display_title(entry, i);
            if entry.is_ready() {
                if let ClipSource::Rendered { path, .. } = &entry.clip {
                    parts.push(path.clone());
                }
            } else {
                on_progress(MergeProgress {
                    stage: MergeStage::Rendering,
                    index: i,
                    total,
                    message: format!("Rendering: {} ({}/{})", label, i + 1, total),
                });
                let job = self.job_for(entry)?;
                let clip = renderer.render(&job)?;
                parts.push(clip.clip_path);
            }

            on_progress(MergeProgress {
                stage: MergeStage::Rendered,
                index: i + 1,
                total,
                message: format!("Completed: {} ({}/{})", label, i + 1, total),
            });
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }

        on_progress(MergeProgress {
            stage: MergeStage::Concatenating,
            index: total,
            total,
            message: "Merging all clips together".to_string(),
        });

        let encoder = self.renderer.concat(&parts, &output)?;

        on_progress(MergeProgress {
            stage: MergeStage::Complete,
            index: total,
            total,
            message: format!("Merged {} clips", total),
        });
        info!(output = %output.display(), clips = total, ?encoder, "Merge complete");

        Ok(Some(MergeOutcome { output, parts }))
    }

    /// Render job for an entry, anchored on original boundaries when known.
    fn job_for(&self, entry: &TimelineEntry) -> Result<RenderJob> {
        let job = match &entry.clip {
            ClipSource::Source(origin)
            | ClipSource::Rendered {
                origin: Some(origin),
                ..
            } => RenderJob::new(&origin.file, origin.original_start, origin.original_end),
            ClipSource::Rendered { path, origin: None } => {
                let duration = self
                    .renderer
                    .transcoder()
                    .probe_duration(path)
                    .map_err(|e| PhrasecutError::Render {
                        source_file: path.clone(),
                        start: 0.0,
                        end: 0.0,
                        reason: format!("could not probe clip duration: {:#}", e),
                    })?;
                RenderJob::new(path, 0.0, duration)
            }
        };
        Ok(job
            .with_trim(entry.start_trim_ms, entry.end_trim_ms)
            .with_speed(entry.speed))
    }
}

fn display_title(entry: &TimelineEntry, index: usize) -> String {
    if entry.title.trim().is_empty() {
        format!("clip {}", index + 1)
    } else {
        entry.title.trim().to_string()
    }
}

/// `<YYYY-MM-DD_HH-MM>_<first five title words>.mp4`
pub fn merged_file_name(titles: &[&str]) -> String {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M");
    let words: Vec<&str> = titles
        .iter()
        .flat_map(|t| t.split_whitespace())
        .take(NAME_WORDS)
        .collect();

    let mut name: String = words
        .join("_")
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .take(MAX_NAME_CHARS)
        .collect();
    if name.is_empty() {
        name = "merged".to_string();
    }
    format!("{}_{}.mp4", timestamp, name)
}
