//! Transcript providers.
//!
//! A [`TranscriptProvider`] turns a video path into its word-level
//! [`Transcript`]. The corpus index only talks to this trait, so the way
//! transcripts are produced or stored stays outside the core.
//!
//! [`FileTranscriptProvider`] reads sidecar files that share the video's
//! stem, trying `<stem>.json`, then `<stem>.vtt`, then `<stem>.srt`.

use crate::error::{PhrasecutError, Result};
use crate::subtitle::SubtitleParser;
use crate::types::{Transcript, Word};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of word-level timing data for video files.
pub trait TranscriptProvider: Send + Sync {
    /// Load the transcript for `source`.
    ///
    /// Returns [`PhrasecutError::TranscriptNotFound`] when no transcript is
    /// available for the file.
    fn load(&self, source: &Path) -> Result<Transcript>;
}

/// Sidecar extensions in lookup order
pub const SIDECAR_EXTENSIONS: &[&str] = &["json", "vtt", "srt"];

/// Reads transcripts from sidecar files next to each video.
pub struct FileTranscriptProvider {
    subtitles: SubtitleParser,
}

impl FileTranscriptProvider {
    pub fn new() -> Result<Self> {
        Ok(FileTranscriptProvider {
            subtitles: SubtitleParser::new()?,
        })
    }

    /// Existing sidecar files for `source`, in lookup order.
    pub fn candidates(source: &Path) -> Vec<PathBuf> {
        let Some(stem) = source.file_stem() else {
            return Vec::new();
        };
        let parent = source.parent().unwrap_or_else(|| Path::new(""));
        SIDECAR_EXTENSIONS
            .iter()
            .map(|ext| {
                let mut name = stem.to_os_string();
                name.push(".");
                name.push(ext);
                parent.join(name)
            })
            .filter(|p| p.is_file())
            .collect()
    }

    fn load_sidecar(&self, source: &Path, sidecar: &Path) -> Result<Transcript> {
        let is_json = sidecar
            .extension()
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));

        if is_json {
            let raw = std::fs::read_to_string(sidecar)?;
            return parse_json_transcript(source, sidecar, &raw);
        }

        let cues = self.subtitles.parse_file(sidecar)?;
        let sentences = cues.iter().map(|c| c.content.clone()).collect();
        let words = cues.into_iter().flat_map(|c| c.words).collect();
        Ok(Transcript::new(source, words).with_sentences(sentences))
    }
}

impl TranscriptProvider for FileTranscriptProvider {
    fn load(&self, source: &Path) -> Result<Transcript> {
        let mut last_error = None;

        for sidecar in Self::candidates(source) {
            match self.load_sidecar(source, &sidecar) {
                Ok(transcript) if !transcript.is_empty() => {
                    debug!(file = %source.display(), sidecar = %sidecar.display(), words = transcript.len(), "Loaded transcript");
                    return Ok(transcript);
                }
                Ok(_) => {
                    debug!(sidecar = %sidecar.display(), "Sidecar has no timed words");
                }
                Err(e) => {
                    warn!(sidecar = %sidecar.display(), error = %e, "Failed to read sidecar");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PhrasecutError::TranscriptNotFound {
            path: source.to_path_buf(),
        }))
    }
}

#[derive(Deserialize)]
struct RawWord {
    word: String,
    start: Option<f64>,
    end: Option<f64>,
}

#[derive(Deserialize)]
struct RawSegment {
    content: Option<String>,
    #[serde(default)]
    words: Vec<RawWord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Word(RawWord),
    Segment(RawSegment),
}

impl RawWord {
    fn into_word(self) -> Option<Word> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if !self.word.trim().is_empty() => {
                Some(Word::new(self.word.trim(), start, end))
            }
            _ => None,
        }
    }
}

/// Parse a JSON transcript: either a list of segments with nested `words`
/// or a flat list of words.
pub fn parse_json_transcript(source: &Path, sidecar: &Path, raw: &str) -> Result<Transcript> {
    let entries: Vec<RawEntry> =
        serde_json::from_str(raw).map_err(|e| PhrasecutError::TranscriptParse {
            path: sidecar.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut words = Vec::new();
    let mut sentences = Vec::new();

    for entry in entries {
        match entry {
            RawEntry::Word(raw) => words.extend(raw.into_word()),
            RawEntry::Segment(segment) => {
                let text = match segment.content.as_deref().map(str::trim) {
                    Some(content) if !content.is_empty() => content.to_string(),
                    _ => segment
                        .words
                        .iter()
                        .map(|w| w.word.trim())
                        .filter(|w| !w.is_empty())
                        .collect::<Vec<_>>()
                        .join(" "),
                };
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    sentences.push(text);
                }
                words.extend(segment.words.into_iter().filter_map(RawWord::into_word));
            }
        }
    }

    Ok(Transcript::new(source, words).with_sentences(sentences))
}

/// In-memory provider keyed by source path.
#[derive(Default)]
pub struct MemoryTranscriptProvider {
    transcripts: RwLock<HashMap<PathBuf, Transcript>>,
}

impl MemoryTranscriptProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transcript under its own source path.
    pub fn insert(&self, transcript: Transcript) {
        self.transcripts
            .write()
            .insert(transcript.source.clone(), transcript);
    }

    /// Register `(text, start, end)` words for `source`.
    pub fn insert_words(&self, source: impl Into<PathBuf>, words: &[(&str, f64, f64)]) {
        let words = words
            .iter()
            .map(|(text, start, end)| Word::new(*text, *start, *end))
            .collect();
        self.insert(Transcript::new(source, words));
    }

    pub fn remove(&self, source: &Path) -> Option<Transcript> {
        self.transcripts.write().remove(source)
    }

    pub fn len(&self) -> usize {
        self.transcripts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.read().is_empty()
    }
}

impl TranscriptProvider for MemoryTranscriptProvider {
    fn load(&self, source: &Path) -> Result<Transcript> {
        self.transcripts
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| PhrasecutError::TranscriptNotFound {
                path: source.to_path_buf(),
            })
    }
}
