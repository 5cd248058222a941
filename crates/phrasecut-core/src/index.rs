//! In-memory corpus index over the selected transcripts.
//!
//! The `CorpusIndex` is the data structure every search reads from. For each
//! selected file it keeps:
//!
//! - the word-level [`Transcript`]
//! - a flattened text form (normalized tokens joined by single spaces)
//! - a byte-offset map from the flattened text back to word indices
//!
//! ## Architecture
//!
//! The index is built for one *file set* at a time. Looking up the same set
//! again is a cache hit; a different set triggers a full rebuild, loading
//! transcripts in parallel with Rayon. Lookups hand out `Arc`s so a rebuild
//! started by one session never invalidates transcripts another session is
//! still scanning.

use crate::provider::TranscriptProvider;
use crate::types::{SilenceGap, Transcript, Word};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Stand-in for whitespace inside a single token so it cannot match across
/// the token separator.
const INNER_SPACE: char = '\u{1f}';

/// A transcript plus its flattened, searchable text.
#[derive(Debug, Clone)]
pub struct IndexedTranscript {
    pub transcript: Transcript,

    /// Normalized tokens joined by single spaces
    text: String,

    /// Byte offset of each word inside `text`
    word_starts: Vec<usize>,
}

impl IndexedTranscript {
    pub fn new(transcript: Transcript) -> Self {
        let mut text = String::with_capacity(transcript.words.len() * 6);
        let mut word_starts = Vec::with_capacity(transcript.words.len());

        for word in &transcript.words {
            if !text.is_empty() {
                text.push(' ');
            }
            word_starts.push(text.len());
            text.extend(
                word.norm
                    .chars()
                    .map(|c| if c.is_whitespace() { INNER_SPACE } else { c }),
            );
        }

        IndexedTranscript {
            transcript,
            text,
            word_starts,
        }
    }

    pub fn source(&self) -> &Path {
        &self.transcript.source
    }

    pub fn words(&self) -> &[Word] {
        &self.transcript.words
    }

    /// The flattened search text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Word index starting exactly at byte `offset`, if any.
    pub fn word_at_offset(&self, offset: usize) -> Option<usize> {
        self.word_starts.binary_search(&offset).ok()
    }

    /// Word index whose text ends exactly at byte `offset`, if any.
    pub fn word_ending_at(&self, offset: usize) -> Option<usize> {
        let idx = match self.word_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i,
        }
        .checked_sub(1)?;
        let end = self.word_starts[idx] + self.word_len(idx);
        (end == offset).then_some(idx)
    }

    fn word_len(&self, idx: usize) -> usize {
        let next = self
            .word_starts
            .get(idx + 1)
            .map_or(self.text.len(), |n| n - 1);
        next - self.word_starts[idx]
    }

    /// The pause following word `idx`
    pub fn gap_after(&self, idx: usize) -> Option<SilenceGap> {
        self.transcript.gap_after(idx)
    }
}

/// One sentence with its neighbours, for browsing a corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentenceEntry {
    pub file: PathBuf,
    pub prev: String,
    pub current: String,
    pub next: String,
}

/// Statistics about the current build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub files: usize,
    pub indexed: usize,
    pub missing: usize,
    pub words: usize,
    pub generation: u64,
}

#[derive(Default)]
struct IndexState {
    /// File set the index was built for
    files: BTreeSet<PathBuf>,
    entries: HashMap<PathBuf, Arc<IndexedTranscript>>,
    missing: Vec<PathBuf>,
    built: bool,
}

/// Per-file transcript cache for the current selection.
pub struct CorpusIndex {
    provider: Arc<dyn TranscriptProvider>,
    state: RwLock<IndexState>,

    /// Bumped on every rebuild
    generation: AtomicU64,
}

impl CorpusIndex {
    pub fn new(provider: Arc<dyn TranscriptProvider>) -> Self {
        CorpusIndex {
            provider,
            state: RwLock::new(IndexState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Get the current generation (rebuild counter).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CorpusStats {
        let state = self.state.read();
        CorpusStats {
            files: state.files.len(),
            indexed: state.entries.len(),
            missing: state.missing.len(),
            words: state.entries.values().map(|e| e.words().len()).sum(),
            generation: self.generation(),
        }
    }

    /// Files of the current build that had no usable transcript
    pub fn missing(&self) -> Vec<PathBuf> {
        self.state.read().missing.clone()
    }

    /// Drop the current build; the next lookup rebuilds.
    pub fn invalidate(&self) {
        *self.state.write() = IndexState::default();
    }

    /// Indexed transcripts for `files`, in the caller's order.
    ///
    /// Files without a transcript are skipped. Duplicate paths are returned
    /// once.
    pub fn lookup(&self, files: &[PathBuf]) -> Vec<Arc<IndexedTranscript>> {
        let wanted: BTreeSet<PathBuf> = files.iter().cloned().collect();

        {
            let state = self.state.read();
            if state.built && state.files == wanted {
                debug!(files = wanted.len(), "Corpus index cache hit");
                return collect_in_order(&state.entries, files);
            }
        }

        let (entries, missing) = self.build(&wanted);
        let result = collect_in_order(&entries, files);

        let mut state = self.state.write();
        *state = IndexState {
            files: wanted,
            entries,
            missing,
            built: true,
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    #[instrument(skip(self, files), fields(files = files.len()))]
    fn build(
        &self,
        files: &BTreeSet<PathBuf>,
    ) -> (HashMap<PathBuf, Arc<IndexedTranscript>>, Vec<PathBuf>) {
        let loaded: Vec<(PathBuf, Option<IndexedTranscript>)> = files
            .par_iter()
            .map(|path| match self.provider.load(path) {
                Ok(transcript) if !transcript.is_empty() => {
                    (path.clone(), Some(IndexedTranscript::new(transcript)))
                }
                Ok(_) => {
                    debug!(file = %path.display(), "Transcript has no words, skipping");
                    (path.clone(), None)
                }
                Err(e) if e.is_skippable() => {
                    debug!(file = %path.display(), error = %e, "No transcript, skipping");
                    (path.clone(), None)
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Transcript unreadable, skipping");
                    (path.clone(), None)
                }
            })
            .collect();

        let mut entries = HashMap::with_capacity(loaded.len());
        let mut missing = Vec::new();
        for (path, indexed) in loaded {
            match indexed {
                Some(indexed) => {
                    entries.insert(path, Arc::new(indexed));
                }
                None => missing.push(path),
            }
        }

        info!(
            indexed = entries.len(),
            missing = missing.len(),
            "Corpus index rebuilt"
        );
        (entries, missing)
    }

    /// Sentences of `files` with their neighbours.
    ///
    /// Consecutive sentences that differ only in case are collapsed.
    pub fn sentences(&self, files: &[PathBuf]) -> Vec<SentenceEntry> {
        let mut out = Vec::new();

        for indexed in self.lookup(files) {
            let mut texts: Vec<String> = Vec::new();
            let mut previous: Option<String> = None;
            for sentence in &indexed.transcript.sentences {
                let text = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    continue;
                }
                let lower = text.to_lowercase();
                if previous.as_deref() == Some(lower.as_str()) {
                    continue;
                }
                previous = Some(lower);
                texts.push(text);
            }

            for (i, current) in texts.iter().enumerate() {
                out.push(SentenceEntry {
                    file: indexed.source().to_path_buf(),
                    prev: if i > 0 { texts[i - 1].clone() } else { String::new() },
                    current: current.clone(),
                    next: texts.get(i + 1).cloned().unwrap_or_default(),
                });
            }
        }
        out
    }
}

fn collect_in_order(
    entries: &HashMap<PathBuf, Arc<IndexedTranscript>>,
    files: &[PathBuf],
) -> Vec<Arc<IndexedTranscript>> {
    let mut seen = BTreeSet::new();
    files
        .iter()
        .filter(|f| seen.insert(f.as_path()))
        .filter_map(|f| entries.get(f).cloned())
        .collect()
}

impl std::fmt::Debug for CorpusIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CorpusIndex")
            .field("files", &stats.files)
            .field("indexed", &stats.indexed)
            .field("generation", &stats.generation)
            .finish()
    }
}
