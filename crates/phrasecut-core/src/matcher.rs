//! Segment matching.
//!
//! For one [`SearchGroup`] the matcher finds every span of consecutive words
//! that spells the group's phrase, filters short spans by the pause that
//! follows them and ranks what is left.
//!
//! ## Performance
//!
//! - All windows of one size are compiled into a single Aho-Corasick automaton
//!   and matched against each transcript's flattened text in one pass
//! - Hits are accepted only when they start and end on word boundaries
//! - Transcripts are scanned in parallel via Rayon; results are merged back
//!   in file order before ranking
//!
//! ## Ranking
//!
//! Candidates are sorted by duration, longest first. The sort is stable, so
//! equal durations keep file order and then position order. Each bucket is
//! capped at `max_results`.

use crate::cancel::CancelToken;
use crate::error::{PhrasecutError, Result};
use crate::index::IndexedTranscript;
use crate::query::{QueryWindow, SearchGroup};
use crate::types::{MatchCandidate, SilenceConstraint};
use aho_corasick::AhoCorasick;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default cap on candidates per bucket
pub const DEFAULT_MAX_RESULTS: usize = 25;

/// Tuning for one matcher run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchOptions {
    pub silence: SilenceConstraint,

    /// Cap on candidates per bucket (at least one)
    pub max_results: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            silence: SilenceConstraint::default(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// Ranked candidates for one matched window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBucket {
    /// Normalized window text
    pub label: String,
    pub word_count: usize,
    pub is_partial: bool,
    pub candidates: Vec<MatchCandidate>,
}

impl ResultBucket {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Match a group against the given transcripts.
///
/// Tries the full phrase first. When it has no surviving candidates and the
/// group allows partial matches, walks the fallback window sizes longest
/// first and stops at the first size where any window matches; each matching
/// window of that size becomes its own bucket. An empty result is not an
/// error.
pub fn match_group(
    group: &SearchGroup,
    transcripts: &[Arc<IndexedTranscript>],
    options: &MatchOptions,
    cancel: &CancelToken,
) -> Result<Vec<ResultBucket>> {
    for size in group.window_sizes() {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let is_partial = size < group.word_count();
        let windows = if is_partial {
            group.windows(size)
        } else {
            vec![group.full_window()]
        };

        let buckets: Vec<ResultBucket> = match_windows(&windows, transcripts, options, cancel)?
            .into_iter()
            .zip(&windows)
            .filter(|(candidates, _)| !candidates.is_empty())
            .map(|(mut candidates, window)| {
                for c in &mut candidates {
                    c.is_partial = is_partial;
                }
                ResultBucket {
                    label: window.label(),
                    word_count: window.len(),
                    is_partial,
                    candidates,
                }
            })
            .collect();

        if !buckets.is_empty() {
            debug!(
                group = group.index,
                size,
                buckets = buckets.len(),
                "Group matched"
            );
            return Ok(buckets);
        }
        trace!(group = group.index, size, "No matches at window size");
    }

    Ok(Vec::new())
}

/// Ranked candidates for each window, in window order.
pub fn match_windows(
    windows: &[QueryWindow],
    transcripts: &[Arc<IndexedTranscript>],
    options: &MatchOptions,
    cancel: &CancelToken,
) -> Result<Vec<Vec<MatchCandidate>>> {
    if windows.is_empty() {
        return Ok(Vec::new());
    }

    let labels: Vec<String> = windows.iter().map(QueryWindow::label).collect();
    let automaton = AhoCorasick::new(&labels)
        .map_err(|e| PhrasecutError::Internal(format!("failed to build matcher: {}", e)))?;

    let per_file: Vec<Vec<Vec<MatchCandidate>>> = transcripts
        .par_iter()
        .map(|t| {
            if cancel.is_cancelled() {
                return vec![Vec::new(); windows.len()];
            }
            scan_transcript(&automaton, windows, t, &options.silence)
        })
        .collect();

    let max_results = options.max_results.max(1);
    let mut merged: Vec<Vec<MatchCandidate>> = vec![Vec::new(); windows.len()];
    for file_hits in per_file {
        for (slot, hits) in merged.iter_mut().zip(file_hits) {
            slot.extend(hits);
        }
    }

    for candidates in &mut merged {
        candidates.sort_by(|a, b| b.duration().total_cmp(&a.duration()));
        candidates.truncate(max_results);
    }
    Ok(merged)
}

fn scan_transcript(
    automaton: &AhoCorasick,
    windows: &[QueryWindow],
    transcript: &IndexedTranscript,
    silence: &SilenceConstraint,
) -> Vec<Vec<MatchCandidate>> {
    let mut hits: Vec<Vec<MatchCandidate>> = vec![Vec::new(); windows.len()];
    let words = transcript.words();

    for hit in automaton.find_overlapping_iter(transcript.text()) {
        let Some(first) = transcript.word_at_offset(hit.start()) else {
            continue;
        };
        if transcript.word_ending_at(hit.end()).is_none() {
            continue;
        }

        let window = &windows[hit.pattern().as_usize()];
        let last = first + window.len() - 1;
        let (Some(first_word), Some(last_word)) = (words.get(first), words.get(last)) else {
            continue;
        };
        if last_word.end <= first_word.start {
            continue;
        }

        let gap = transcript.gap_after(last);
        if !silence.admits(window.len(), gap.as_ref()) {
            continue;
        }

        let slot = &mut hits[hit.pattern().as_usize()];
        let duplicate = slot
            .iter()
            .any(|c| c.start == first_word.start && c.end == last_word.end);
        if duplicate {
            continue;
        }

        slot.push(MatchCandidate {
            source_file: transcript.source().to_path_buf(),
            start: first_word.start,
            end: last_word.end,
            text: words[first..=last]
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            word_count: window.len(),
            is_partial: false,
            word_index: first,
        });
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PlanOptions;
    use crate::types::{Transcript, Word};

    fn indexed(source: &str, words: &[(&str, f64, f64)]) -> Arc<IndexedTranscript> {
        let words = words.iter().map(|(t, s, e)| Word::new(*t, *s, *e)).collect();
        Arc::new(IndexedTranscript::new(Transcript::new(source, words)))
    }

    fn group(text: &str, options: PlanOptions) -> SearchGroup {
        SearchGroup::new(0, text, options).unwrap()
    }

    fn run(g: &SearchGroup, ts: &[Arc<IndexedTranscript>], options: &MatchOptions) -> Vec<ResultBucket> {
        match_group(g, ts, options, &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_hello_world() {
        let ts = vec![indexed("a.mp4", &[("hello", 0.0, 0.5), ("world", 0.6, 1.1)])];
        let options = MatchOptions {
            silence: SilenceConstraint::new(0.0, 10.0, 2),
            max_results: 25,
        };

        let buckets = run(&group("hello world", PlanOptions::exact()), &ts, &options);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].label, "hello world");
        assert!(!buckets[0].is_partial);
        let c = &buckets[0].candidates[0];
        assert_eq!(c.start, 0.0);
        assert_eq!(c.end, 1.1);
        assert_eq!(c.text, "hello world");
        assert_eq!(c.word_count, 2);
    }

    #[test]
    fn test_no_match_is_empty() {
        let ts = vec![indexed("a.mp4", &[("hello", 0.0, 0.5), ("world", 0.6, 1.1)])];
        let buckets = run(&group("goodbye", PlanOptions::all_partial()), &ts, &MatchOptions::default());
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_word_boundaries() {
        let ts = vec![indexed("a.mp4", &[("shello", 0.0, 0.5), ("worlds", 0.6, 1.1), ("hello", 2.0, 2.5)])];
        let options = MatchOptions {
            silence: SilenceConstraint::unbounded(),
            max_results: 25,
        };
        assert!(run(&group("hello world", PlanOptions::exact()), &ts, &options).is_empty());

        let buckets = run(&group("hello", PlanOptions::exact()), &ts, &options);
        assert_eq!(buckets[0].candidates.len(), 1);
        assert_eq!(buckets[0].candidates[0].start, 2.0);
    }

    #[test]
    fn test_partial_fallback_bucket() {
        let ts = vec![indexed("a.mp4", &[("x", 0.0, 0.5), ("b", 1.0, 1.5), ("c", 1.6, 2.0)])];
        let options = MatchOptions {
            silence: SilenceConstraint::unbounded(),
            max_results: 25,
        };

        assert!(run(&group("a b c", PlanOptions::exact()), &ts, &options).is_empty());

        let buckets = run(&group("a b c", PlanOptions::all_partial()), &ts, &options);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].label, "b c");
        assert!(buckets[0].is_partial);
        assert!(buckets[0].candidates[0].is_partial);
        assert_eq!(buckets[0].candidates[0].start, 1.0);
    }

    #[test]
    fn test_silence_filter_on_short_matches() {
        let ts = vec![indexed("a.mp4", &[("one", 0.0, 1.0), ("two", 2.0, 3.0)])];
        let g = group("one", PlanOptions::exact());

        let wide = MatchOptions {
            silence: SilenceConstraint::new(0.5, 2.0, 1),
            max_results: 25,
        };
        assert_eq!(run(&g, &ts, &wide).len(), 1);

        let narrow = MatchOptions {
            silence: SilenceConstraint::new(1.5, 2.0, 1),
            max_results: 25,
        };
        assert!(run(&g, &ts, &narrow).is_empty());
    }

    #[test]
    fn test_ranking_is_stable_and_capped() {
        let ts = vec![
            indexed("a.mp4", &[("yes", 0.0, 0.5), ("yes", 1.0, 1.5), ("yes", 2.0, 3.0)]),
            indexed("b.mp4", &[("yes", 0.0, 0.5)]),
        ];
        let options = MatchOptions {
            silence: SilenceConstraint::unbounded(),
            max_results: 3,
        };

        let buckets = run(&group("yes", PlanOptions::exact()), &ts, &options);
        let c = &buckets[0].candidates;
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].start, 2.0);
        // Equal durations keep file then position order
        assert_eq!(c[1].source_file, std::path::PathBuf::from("a.mp4"));
        assert_eq!(c[1].start, 0.0);
        assert_eq!(c[2].start, 1.0);
    }

    #[test]
    fn test_overlapping_repeats() {
        let ts = vec![indexed("a.mp4", &[("no", 0.0, 0.2), ("no", 0.3, 0.5), ("no", 0.6, 0.8)])];
        let options = MatchOptions {
            silence: SilenceConstraint::unbounded(),
            max_results: 25,
        };
        let buckets = run(&group("no no", PlanOptions::exact()), &ts, &options);
        assert_eq!(buckets[0].candidates.len(), 2);
    }

    #[test]
    fn test_cancelled_scan_is_empty() {
        let ts = vec![indexed("a.mp4", &[("hello", 0.0, 0.5)])];
        let cancel = CancelToken::new();
        cancel.cancel();
        let buckets = match_group(&group("hello", PlanOptions::exact()), &ts, &MatchOptions::default(), &cancel).unwrap();
        assert!(buckets.is_empty());
    }
}
