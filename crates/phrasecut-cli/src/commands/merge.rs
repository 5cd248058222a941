//! Merge command - render and join a timeline.

use super::drain;
use crate::app::App;
use crate::OutputFormat;
use anyhow::Context;
use phrasecut_core::{Config, MergeRequest, TimelineEntry};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Accepted timeline file layouts
#[derive(Deserialize)]
#[serde(untagged)]
enum TimelineFile {
    Request(MergeRequest),
    Entries(Vec<TimelineEntry>),
}

/// Read a timeline file into a merge request.
pub fn load_timeline(path: &Path) -> anyhow::Result<MergeRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read timeline {}", path.display()))?;
    let file: TimelineFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid timeline {}", path.display()))?;

    Ok(match file {
        TimelineFile::Request(request) => request,
        TimelineFile::Entries(entries) => MergeRequest::new(entries),
    })
}

/// Run the merge command.
pub fn run(
    config: Config,
    timeline: &Path,
    out_dir: Option<PathBuf>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;

    let mut request = load_timeline(timeline)?;
    if out_dir.is_some() {
        request.output_dir = out_dir;
    }

    let stream = app.manager.start_merge(request)?;
    let summary = drain(stream, output)?;
    if summary.cancelled {
        eprintln!("Merge cancelled.");
    }

    Ok(())
}
