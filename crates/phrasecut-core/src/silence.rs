//! Silence scanning.
//!
//! Enumerates the pauses between consecutive words whose duration falls in
//! an inclusive range, with no text query involved. Results are ranked
//! longest first, capped globally and then grouped into one-second buckets
//! for presentation.

use crate::cancel::CancelToken;
use crate::index::IndexedTranscript;
use crate::types::{SilenceConstraint, SilenceGap};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Pauses grouped under one display label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceBucket {
    /// `"<1s silences"` or `"{s}-{s+1}s silences"`
    pub label: String,

    /// Whole seconds of the bucket's lower bound
    pub lower_sec: u64,

    pub gaps: Vec<SilenceGap>,
}

/// Label for a pause of `duration` seconds.
pub fn bucket_label(duration: f64) -> String {
    if duration < 1.0 {
        "<1s silences".to_string()
    } else {
        let s = duration.floor() as u64;
        format!("{}-{}s silences", s, s + 1)
    }
}

/// Every gap in `[min, max]` across `transcripts`, in file and position order.
pub fn scan(
    transcripts: &[Arc<IndexedTranscript>],
    range: &SilenceConstraint,
    cancel: &CancelToken,
) -> Vec<SilenceGap> {
    let per_file: Vec<Vec<SilenceGap>> = transcripts
        .par_iter()
        .map(|t| {
            if cancel.is_cancelled() {
                return Vec::new();
            }
            let gaps: Vec<SilenceGap> = t
                .transcript
                .gaps()
                .filter(|g| range.contains(g.duration))
                .collect();
            debug!(file = %t.source().display(), found = gaps.len(), "Scanned for silences");
            gaps
        })
        .collect();

    per_file.into_iter().flatten().collect()
}

/// Gaps in range, longest first, at most `max_results` overall.
pub fn scan_ranked(
    transcripts: &[Arc<IndexedTranscript>],
    range: &SilenceConstraint,
    max_results: usize,
    cancel: &CancelToken,
) -> Vec<SilenceGap> {
    let mut gaps = scan(transcripts, range, cancel);
    gaps.sort_by(|a, b| b.duration.total_cmp(&a.duration));
    gaps.truncate(max_results.max(1));
    gaps
}

/// Group ranked gaps into buckets, longest bucket first.
///
/// Each bucket keeps the incoming order and holds at most `max_per_bucket`
/// gaps.
pub fn bucket(gaps: Vec<SilenceGap>, max_per_bucket: usize) -> Vec<SilenceBucket> {
    let max_per_bucket = max_per_bucket.max(1);
    // Keyed by whole seconds of the lower bound
    let mut buckets: BTreeMap<u64, SilenceBucket> = BTreeMap::new();

    for gap in gaps {
        let lower_sec = if gap.duration < 1.0 {
            0
        } else {
            gap.duration.floor() as u64
        };
        let bucket = buckets.entry(lower_sec).or_insert_with(|| SilenceBucket {
            label: bucket_label(gap.duration),
            lower_sec,
            gaps: Vec::new(),
        });
        if bucket.gaps.len() < max_per_bucket {
            bucket.gaps.push(gap);
        }
    }

    buckets.into_values().rev().collect()
}
