//! Query planning.
//!
//! A raw query is a `;`-separated list of phrases. Each phrase becomes an
//! independent [`SearchGroup`]; the declared order of the groups is the order
//! in which sessions start them.
//!
//! ## Query Syntax
//!
//! - `hello world` - one group matching the two words in sequence
//! - `hello world; good night` - two independent groups
//! - `Hello, World!` - punctuation around words is ignored, case too
//!
//! In partial mode a group also plans shorter contiguous sub-windows,
//! longest first, so a sub-phrase can surface when the full phrase never
//! occurs. The window sizes form an explicit worklist rather than a
//! recursion, which keeps long queries bounded.

use serde::{Deserialize, Serialize};

/// Separator between independent search groups
pub const GROUP_SEPARATOR: char = ';';

/// Shortest sub-window considered in plain partial mode
pub const DEFAULT_PARTIAL_MIN_WORDS: usize = 3;

/// Normalize one token for matching.
///
/// Lowercases and trims leading/trailing characters that are not letters or
/// digits, so `"Hello,"` and `"hello"` compare equal. Returns an empty string
/// for pure punctuation.
pub fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Split free text into normalized match tokens.
pub fn normalize_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(normalize_token)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Options controlling partial-match expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Allow sub-windows when the full phrase has no matches
    pub allow_partial: bool,

    /// Extend partial expansion down to single words
    pub allow_all_partial: bool,

    /// Shortest sub-window in plain partial mode
    pub partial_min_words: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            allow_partial: false,
            allow_all_partial: false,
            partial_min_words: DEFAULT_PARTIAL_MIN_WORDS,
        }
    }
}

impl PlanOptions {
    /// Full matches only
    pub fn exact() -> Self {
        Self::default()
    }

    /// Partial matches down to `partial_min_words`
    pub fn partial() -> Self {
        PlanOptions {
            allow_partial: true,
            ..Self::default()
        }
    }

    /// Partial matches down to single words
    pub fn all_partial() -> Self {
        PlanOptions {
            allow_partial: true,
            allow_all_partial: true,
            ..Self::default()
        }
    }
}

/// One independent query unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchGroup {
    /// Position among the declared groups (0-based)
    pub index: usize,

    /// Trimmed text as the user typed it
    pub raw_text: String,

    /// Normalized words to match in sequence
    pub words: Vec<String>,

    pub allow_partial: bool,
    pub allow_all_partial: bool,
    pub partial_min_words: usize,
}

/// A contiguous run of a group's words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWindow {
    /// Offset of the first word inside the group
    pub offset: usize,

    /// Normalized words of the window
    pub words: Vec<String>,
}

impl QueryWindow {
    /// Words joined by single spaces; used as the bucket label
    pub fn label(&self) -> String {
        self.words.join(" ")
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl SearchGroup {
    /// Build a group from one phrase. Returns `None` when nothing matchable
    /// remains after normalization.
    pub fn new(index: usize, raw_text: &str, options: PlanOptions) -> Option<Self> {
        let raw_text = raw_text.trim();
        let words = normalize_words(raw_text);
        if words.is_empty() {
            return None;
        }
        Some(SearchGroup {
            index,
            raw_text: raw_text.to_string(),
            words,
            allow_partial: options.allow_partial || options.allow_all_partial,
            allow_all_partial: options.allow_all_partial,
            partial_min_words: options.partial_min_words.max(1),
        })
    }

    /// Number of words in the full phrase
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// The normalized full phrase
    pub fn label(&self) -> String {
        self.words.join(" ")
    }

    /// The full-length window
    pub fn full_window(&self) -> QueryWindow {
        QueryWindow {
            offset: 0,
            words: self.words.clone(),
        }
    }

    /// Shortest window size the fallback may try
    pub fn min_window(&self) -> usize {
        if self.allow_all_partial {
            1
        } else {
            self.partial_min_words
        }
    }

    /// Every window size to try, longest first, starting with the full length.
    pub fn window_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.word_count()];
        sizes.extend(self.fallback_sizes());
        sizes
    }

    /// Fallback window sizes, longest first, excluding the full length.
    ///
    /// Empty unless partial mode is enabled.
    pub fn fallback_sizes(&self) -> Vec<usize> {
        if !self.allow_partial {
            return Vec::new();
        }
        let n = self.word_count();
        let min = self.min_window();
        (min..n).rev().collect()
    }

    /// Distinct contiguous sub-windows of `size` words, in query order.
    pub fn windows(&self, size: usize) -> Vec<QueryWindow> {
        if size == 0 || size > self.words.len() {
            return Vec::new();
        }
        let mut out: Vec<QueryWindow> = Vec::new();
        for (offset, slice) in self.words.windows(size).enumerate() {
            if out.iter().any(|w| w.words == slice) {
                continue;
            }
            out.push(QueryWindow {
                offset,
                words: slice.to_vec(),
            });
        }
        out
    }
}

/// Split raw query text into ordered search groups.
///
/// Empty and punctuation-only phrases are dropped; an empty result is a
/// no-op for the caller, not an error.
pub fn plan(raw: &str, options: PlanOptions) -> Vec<SearchGroup> {
    raw.split(GROUP_SEPARATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map({
            let mut next_index = 0usize;
            move |part| {
                let group = SearchGroup::new(next_index, part, options)?;
                next_index += 1;
                Some(group)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("Hello,"), "hello");
        assert_eq!(normalize_token("\"Quoted\""), "quoted");
        assert_eq!(normalize_token("don't"), "don't");
        assert_eq!(normalize_token("..."), "");
        assert_eq!(normalize_token("ÄRGER!"), "ärger");
    }

    #[test]
    fn test_plan_splits_and_preserves_order() {
        let groups = plan(" hello world ;; good night; ", PlanOptions::exact());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].raw_text, "hello world");
        assert_eq!(groups[0].index, 0);
        assert_eq!(groups[1].words, vec!["good", "night"]);
        assert_eq!(groups[1].index, 1);
    }

    #[test]
    fn test_plan_empty_is_noop() {
        assert!(plan("", PlanOptions::exact()).is_empty());
        assert!(plan(" ; ;", PlanOptions::exact()).is_empty());
        assert!(plan("!!! ; ...", PlanOptions::exact()).is_empty());
    }

    #[test]
    fn test_comma_is_literal() {
        let groups = plan("yes, we can", PlanOptions::exact());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].words, vec!["yes", "we", "can"]);
    }

    #[test]
    fn test_fallback_sizes() {
        let exact = SearchGroup::new(0, "a b c d e", PlanOptions::exact()).unwrap();
        assert!(exact.fallback_sizes().is_empty());

        let partial = SearchGroup::new(0, "a b c d e", PlanOptions::partial()).unwrap();
        assert_eq!(partial.fallback_sizes(), vec![4, 3]);

        let all = SearchGroup::new(0, "a b c", PlanOptions::all_partial()).unwrap();
        assert_eq!(all.fallback_sizes(), vec![2, 1]);
        assert_eq!(all.window_sizes(), vec![3, 2, 1]);
        assert_eq!(exact.window_sizes(), vec![5]);

        // Plain partial mode never goes below its minimum
        let short = SearchGroup::new(0, "a b", PlanOptions::partial()).unwrap();
        assert!(short.fallback_sizes().is_empty());
    }

    #[test]
    fn test_windows_are_distinct_and_ordered() {
        let group = SearchGroup::new(0, "a b c", PlanOptions::all_partial()).unwrap();
        let labels: Vec<_> = group.windows(2).iter().map(QueryWindow::label).collect();
        assert_eq!(labels, vec!["a b", "b c"]);

        let repeated = SearchGroup::new(0, "no no no", PlanOptions::all_partial()).unwrap();
        assert_eq!(repeated.windows(1).len(), 1);
        assert_eq!(repeated.windows(2).len(), 1);
        assert!(repeated.windows(4).is_empty());
    }
}
