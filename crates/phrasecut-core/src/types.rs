//! Core data types for Phrasecut.
//!
//! These are the values that flow between the corpus index, the matcher and
//! the renderer. Timing is always in seconds as `f64`, trims are in whole
//! milliseconds.

use crate::query::normalize_token;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A single transcribed word with its timing.
///
/// `norm` is the pre-computed match form of `text` (lowercased, punctuation
/// trimmed) so the matcher never re-normalizes inside its hot loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    /// Word as it appears in the transcript
    pub text: String,

    /// Normalized form used for matching
    #[serde(skip)]
    pub norm: String,

    /// Start time in seconds
    pub start: f64,

    /// End time in seconds
    pub end: f64,
}

impl Word {
    /// Create a word, normalizing its match form.
    ///
    /// `end` is raised to `start` if the source data has them inverted.
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        let text = text.into();
        let norm = normalize_token(&text);
        Word {
            text,
            norm,
            start,
            end: end.max(start),
        }
    }

    /// Duration of the word itself
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Initialize the normalized form after deserialization
    pub fn init_cache(&mut self) {
        if self.norm.is_empty() {
            self.norm = normalize_token(&self.text);
        }
    }
}

/// Ordered word-level timing data for one source file.
///
/// ## Invariants
///
/// - `words` is sorted by `start` (non-decreasing)
/// - every word has `end >= start`
/// - words whose normalized form is empty (pure punctuation) are dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Video file this transcript belongs to
    pub source: PathBuf,

    /// Words ordered by start time
    pub words: Vec<Word>,

    /// Sentence or cue texts in file order, when the source provides them
    pub sentences: Vec<String>,
}

impl Transcript {
    /// Create a transcript, enforcing the ordering invariants.
    pub fn new(source: impl Into<PathBuf>, words: Vec<Word>) -> Self {
        let mut words: Vec<Word> = words
            .into_iter()
            .map(|mut w| {
                w.init_cache();
                w
            })
            .filter(|w| !w.norm.is_empty() && w.start.is_finite() && w.end.is_finite())
            .collect();
        // Stable sort keeps provider order for words sharing a start time
        words.sort_by(|a, b| a.start.total_cmp(&b.start));

        Transcript {
            source: source.into(),
            words,
            sentences: Vec::new(),
        }
    }

    /// Attach sentence texts
    pub fn with_sentences(mut self, sentences: Vec<String>) -> Self {
        self.sentences = sentences;
        self
    }

    /// Number of words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True when the transcript has no usable words
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The pause between word `idx` and the word after it, if any.
    pub fn gap_after(&self, idx: usize) -> Option<SilenceGap> {
        let before = self.words.get(idx)?;
        let after = self.words.get(idx + 1)?;
        Some(SilenceGap::between(&self.source, before, after))
    }

    /// Iterate over every inter-word gap in order.
    pub fn gaps(&self) -> impl Iterator<Item = SilenceGap> + '_ {
        self.words
            .windows(2)
            .map(move |pair| SilenceGap::between(&self.source, &pair[0], &pair[1]))
    }
}

/// The interval between two consecutive transcribed words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceGap {
    pub source_file: PathBuf,

    /// End of the word before the pause
    pub start: f64,

    /// Start of the word after the pause
    pub end: f64,

    /// `max(0, end - start)`; overlapping words count as no pause
    pub duration: f64,

    pub word_before: String,
    pub word_after: String,
}

impl SilenceGap {
    fn between(source: &Path, before: &Word, after: &Word) -> Self {
        SilenceGap {
            source_file: source.to_path_buf(),
            start: before.end,
            end: after.start,
            duration: (after.start - before.end).max(0.0),
            word_before: before.text.clone(),
            word_after: after.text.clone(),
        }
    }
}

/// A located span satisfying one search window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub source_file: PathBuf,

    /// Start of the first matched word
    pub start: f64,

    /// End of the last matched word; always greater than `start`
    pub end: f64,

    /// Matched words as they appear in the transcript
    pub text: String,

    pub word_count: usize,

    /// True when the span matches only a sub-window of the search group
    pub is_partial: bool,

    /// Index of the first matched word inside its transcript
    #[serde(skip)]
    pub word_index: usize,
}

impl MatchCandidate {
    /// Length of the matched span in seconds
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Pause requirement applied to short candidates.
///
/// Candidates with `word_count <= word_count_threshold` must be followed by a
/// pause whose duration lies in `[min, max]`; longer candidates bypass the
/// check. A candidate at the very end of its transcript has no following
/// pause and passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceConstraint {
    pub min: f64,
    pub max: f64,
    pub word_count_threshold: usize,
}

impl SilenceConstraint {
    /// Create a constraint; `max` is raised to `min` if it is smaller.
    pub fn new(min: f64, max: f64, word_count_threshold: usize) -> Self {
        let min = min.max(0.0);
        SilenceConstraint {
            min,
            max: max.max(min),
            word_count_threshold,
        }
    }

    /// A constraint that admits every candidate.
    pub fn unbounded() -> Self {
        SilenceConstraint {
            min: 0.0,
            max: f64::INFINITY,
            word_count_threshold: 0,
        }
    }

    /// True if `duration` lies inside the inclusive range.
    pub fn contains(&self, duration: f64) -> bool {
        self.min <= duration && duration <= self.max
    }

    /// Decide whether a candidate with `word_count` words, followed by
    /// `following` (if any), survives the filter.
    pub fn admits(&self, word_count: usize, following: Option<&SilenceGap>) -> bool {
        if word_count > self.word_count_threshold {
            return true;
        }
        following.map_or(true, |gap| self.contains(gap.duration))
    }
}

impl Default for SilenceConstraint {
    fn default() -> Self {
        SilenceConstraint::new(0.0, 10.0, 2)
    }
}

impl fmt::Display for SilenceConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.3}s, {:.3}s] for <= {} words",
            self.min, self.max, self.word_count_threshold
        )
    }
}
