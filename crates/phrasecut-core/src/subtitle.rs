//! SRT and WebVTT subtitle parsing.
//!
//! Subtitles only carry cue-level timing, so word timings are derived:
//!
//! - Cues with inline karaoke tokens (`<00:00:01.200><c>word</c>`) use the
//!   token timestamps. When any cue in a file has them, cues without them are
//!   dropped, since auto-generated captions repeat each line as a plain
//!   rolling cue.
//! - Plain cues spread their words evenly over the cue duration.
//!
//! In both cases the last word of a cue is stretched to the cue end.

use crate::error::{PhrasecutError, Result};
use crate::types::Word;
use regex::Regex;
use std::path::Path;

/// One subtitle cue with its raw text lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub start: f64,
    pub end: f64,
    pub lines: Vec<String>,
}

/// Words and display text produced from one cue.
#[derive(Debug, Clone)]
pub struct CueWords {
    pub content: String,
    pub words: Vec<Word>,
}

const TIMESTAMP: &str = r"(?:\d{1,2}:)?\d{2}:\d{2}(?:[.,]\d{1,3})?";

/// Compiled patterns for subtitle parsing.
pub struct SubtitleParser {
    cue_timing: Regex,
    timed_token: Regex,
    has_timed_token: Regex,
    style_tag: Regex,
}

impl SubtitleParser {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| PhrasecutError::Internal(format!("bad pattern: {}", e)))
        };
        Ok(SubtitleParser {
            cue_timing: compile(&format!(
                r"(?P<start>{ts})\s*-->\s*(?P<end>{ts})",
                ts = TIMESTAMP
            ))?,
            timed_token: compile(&format!(
                r"<(?P<ts>{ts})><c[^>]*>(?P<word>.*?)</c>",
                ts = TIMESTAMP
            ))?,
            has_timed_token: compile(&format!(r"<{ts}>", ts = TIMESTAMP))?,
            style_tag: compile(r"(?i)</?(?:c|i|b|u)(?:[.\s][^>]*)?>")?,
        })
    }

    /// Parse a subtitle file into word-timed cues.
    pub fn parse_file(&self, path: &Path) -> Result<Vec<CueWords>> {
        let raw = std::fs::read_to_string(path)?;
        let cues = self
            .parse_cues(&raw)
            .map_err(|reason| PhrasecutError::TranscriptParse {
                path: path.to_path_buf(),
                reason,
            })?;
        Ok(self.cues_to_words(&cues))
    }

    /// Split raw subtitle text into cues.
    ///
    /// Returns an error message when a timing line cannot be decoded.
    pub fn parse_cues(&self, raw: &str) -> std::result::Result<Vec<SubtitleCue>, String> {
        let raw = raw.trim_start_matches('\u{feff}');
        let lines: Vec<&str> = raw.lines().collect();
        let mut cues = Vec::new();
        let mut idx = 0;

        while idx < lines.len() {
            let line = lines[idx];
            let trimmed = line.trim();

            if trimmed.starts_with("NOTE") {
                idx += 1;
                while idx < lines.len() && !lines[idx].trim().is_empty() {
                    idx += 1;
                }
                continue;
            }

            let caps = match self.cue_timing.captures(line) {
                Some(caps) if line.contains("-->") => caps,
                _ => {
                    idx += 1;
                    continue;
                }
            };
            let start = parse_timestamp(&caps["start"])?;
            let end = parse_timestamp(&caps["end"])?;
            idx += 1;

            while idx < lines.len() && lines[idx].trim().is_empty() {
                idx += 1;
            }

            let mut text_lines = Vec::new();
            while idx < lines.len() {
                let current = lines[idx];
                if current.trim().is_empty() {
                    idx += 1;
                    break;
                }
                if current.contains("-->") {
                    break;
                }
                for part in current.replace("\\N", "\n").split('\n') {
                    if !part.is_empty() {
                        text_lines.push(part.to_string());
                    }
                }
                idx += 1;
            }

            cues.push(SubtitleCue {
                start,
                end: end.max(start),
                lines: text_lines,
            });
        }

        Ok(cues)
    }

    /// Derive word timings for every cue.
    pub fn cues_to_words(&self, cues: &[SubtitleCue]) -> Vec<CueWords> {
        let any_inline = cues
            .iter()
            .any(|cue| cue.lines.iter().any(|l| self.has_timed_token.is_match(l)));

        cues.iter()
            .filter(|cue| {
                !any_inline || cue.lines.iter().any(|l| self.has_timed_token.is_match(l))
            })
            .filter_map(|cue| {
                let words = self.cue_words(cue, !any_inline);
                if words.is_empty() {
                    return None;
                }
                let content = words
                    .iter()
                    .map(|w| w.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(CueWords { content, words })
            })
            .collect()
    }

    fn cue_words(&self, cue: &SubtitleCue, allow_plain: bool) -> Vec<Word> {
        // (start, text) runs; each run's words share the time until the next run
        let mut tokens: Vec<(f64, String)> = Vec::new();
        let mut plain: Vec<String> = Vec::new();

        for line in cue.lines.iter().filter(|l| !l.trim().is_empty()) {
            if self.has_timed_token.is_match(line) {
                tokens.extend(self.timed_tokens(line, cue.start));
            } else {
                let cleaned = self.clean_text(line);
                if !cleaned.is_empty() {
                    plain.push(cleaned);
                }
            }
        }

        if tokens.is_empty() {
            if plain.is_empty() || !allow_plain {
                return Vec::new();
            }
            tokens.push((cue.start, plain.join(" ")));
        } else {
            tokens.sort_by(|a, b| a.0.total_cmp(&b.0));
        }

        let mut words = Vec::new();
        for (i, (start, text)) in tokens.iter().enumerate() {
            let next_start = tokens
                .get(i + 1)
                .map_or(cue.end, |(s, _)| *s)
                .max(*start);
            let parts: Vec<&str> = text.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            let step = (next_start - start).max(0.0) / parts.len() as f64;
            for (offset, part) in parts.iter().enumerate() {
                let word_start = start + offset as f64 * step;
                let word_end = if step > 0.0 {
                    start + (offset + 1) as f64 * step
                } else {
                    next_start.max(word_start)
                };
                words.push(Word::new(*part, word_start, word_end));
            }
        }

        if let Some(last) = words.last_mut() {
            if last.end < cue.end {
                last.end = cue.end;
            }
        }
        words
    }

    fn timed_tokens(&self, line: &str, cue_start: f64) -> Vec<(f64, String)> {
        let mut tokens = Vec::new();
        let first = match self.timed_token.find(line) {
            Some(m) => m.start(),
            None => {
                let cleaned = self.clean_text(line);
                if !cleaned.is_empty() {
                    tokens.push((cue_start, cleaned));
                }
                return tokens;
            }
        };

        let prefix = self.clean_text(&line[..first]);
        if !prefix.is_empty() {
            tokens.push((cue_start, prefix));
        }

        for caps in self.timed_token.captures_iter(line) {
            let text = self.clean_text(&caps["word"]);
            if text.is_empty() {
                continue;
            }
            if let Ok(start) = parse_timestamp(&caps["ts"]) {
                tokens.push((start, text));
            }
        }
        tokens
    }

    /// Unescape entities and strip styling tags.
    fn clean_text(&self, text: &str) -> String {
        let stripped = self.style_tag.replace_all(text, "");
        unescape_entities(&stripped)
            .replace('\u{2028}', " ")
            .trim()
            .to_string()
    }
}

/// Convert `HH:MM:SS.mmm`, `HH:MM:SS,mmm` or `MM:SS.mmm` to seconds.
pub fn parse_timestamp(value: &str) -> std::result::Result<f64, String> {
    let value = value.trim().replace(',', ".");
    let parts: Vec<&str> = value.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => ("0", *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(format!("unsupported timestamp {:?}", value)),
    };
    let bad = |_| format!("unsupported timestamp {:?}", value);
    let hours: u64 = hours.parse().map_err(bad)?;
    let minutes: u64 = minutes.parse().map_err(bad)?;
    let seconds: f64 = seconds.parse().map_err(|_| format!("unsupported timestamp {:?}", value))?;
    Ok((hours * 3600 + minutes * 60) as f64 + seconds)
}

fn unescape_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
