//! Subcommands and the helpers they share.

pub mod merge;
pub mod render;
pub mod search;
pub mod sentences;
pub mod silences;

use crate::OutputFormat;
use anyhow::{bail, Context};
use phrasecut_core::{DoneSummary, EventKind, EventStream, MatchPayload, SessionEvent};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::warn;

/// Expand `--files` arguments.
///
/// Arguments with glob metacharacters are expanded (sorted, files only);
/// everything else is taken literally. Duplicates are dropped.
pub fn expand_files(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            let path = PathBuf::from(pattern);
            if !files.contains(&path) {
                files.push(path);
            }
            continue;
        }

        let mut matched: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("invalid file pattern {}", pattern))?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Unreadable path while expanding pattern");
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect();
        matched.sort();

        if matched.is_empty() {
            warn!(pattern = %pattern, "Pattern matched no files");
        }
        for path in matched {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }

    Ok(files)
}

/// Print a session's events until its terminal event.
///
/// Fails when the session ends with a fatal error.
pub fn drain(stream: EventStream, output: OutputFormat) -> anyhow::Result<DoneSummary> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut printer = StreamPrinter::new(output);

    for event in stream {
        printer.print(&event, &mut out)?;
        match event.kind {
            EventKind::Done(summary) => return Ok(summary),
            EventKind::Error(e) if e.fatal => bail!("{}", e.message),
            _ => {}
        }
    }

    bail!("session ended without a result")
}

/// Renders events as JSON lines or as readable text.
///
/// Result events carry every match of their bucket so far; in text mode
/// only the matches not yet printed are shown.
pub struct StreamPrinter {
    output: OutputFormat,
    printed: HashMap<(String, String), usize>,
}

impl StreamPrinter {
    pub fn new(output: OutputFormat) -> Self {
        StreamPrinter {
            output,
            printed: HashMap::new(),
        }
    }

    pub fn print(&mut self, event: &SessionEvent, out: &mut impl Write) -> anyhow::Result<()> {
        if self.output == OutputFormat::Json {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
            return Ok(());
        }

        match &event.kind {
            EventKind::Progress(p) => {
                writeln!(out, "[{}/{}] {}", p.index, p.total, p.message)?;
            }
            EventKind::Result(r) => {
                let key = (r.phrase.clone(), r.label.clone());
                let seen = self.printed.entry(key).or_insert(0);
                if *seen == 0 {
                    let partial = if r.is_partial { " (partial)" } else { "" };
                    writeln!(out, "{}{}", r.label, partial)?;
                }
                for payload in r.matches.iter().skip(*seen) {
                    writeln!(out, "  {}", describe(payload))?;
                }
                *seen = (*seen).max(r.matches.len());
            }
            EventKind::Skipped(s) => {
                writeln!(out, "{} (skipped)", s.label)?;
            }
            EventKind::Error(e) if !e.fatal => {
                let phrase = e.phrase.as_deref().unwrap_or("-");
                writeln!(out, "  error [{}]: {}", phrase, e.message)?;
            }
            // Fatal errors and the summary are reported by the caller
            EventKind::Error(_) | EventKind::Done(_) => {}
        }
        Ok(())
    }
}

fn describe(payload: &MatchPayload) -> String {
    match payload {
        MatchPayload::Phrase { candidate, clip } => {
            let mut line = format!(
                "{} {:.2}-{:.2} \"{}\"",
                candidate.source_file.display(),
                candidate.start,
                candidate.end,
                candidate.text
            );
            if let Some(clip) = clip {
                line.push_str(&format!(" -> {}", clip.clip_path.display()));
            }
            line
        }
        MatchPayload::Silence { gap, clip } => {
            let mut line = format!(
                "{} {:.2}-{:.2} ({:.2}s) after \"{}\" before \"{}\"",
                gap.source_file.display(),
                gap.start,
                gap.end,
                gap.duration,
                gap.word_before,
                gap.word_after
            );
            if let Some(clip) = clip {
                line.push_str(&format!(" -> {}", clip.clip_path.display()));
            }
            line
        }
        MatchPayload::Merged { output, clips } => {
            format!("{} clips -> {}", clips, output.display())
        }
    }
}

/// One-line summary for stderr
pub fn summary_line(summary: &DoneSummary) -> String {
    let mut line = format!(
        "{} matches in {} groups",
        summary.total_results, summary.total_buckets
    );
    if summary.total_skipped > 0 {
        line.push_str(&format!(", {} skipped", summary.total_skipped));
    }
    if summary.total_errors > 0 {
        line.push_str(&format!(", {} errors", summary.total_errors));
    }
    if summary.cancelled {
        line.push_str(" (cancelled)");
    }
    line
}
