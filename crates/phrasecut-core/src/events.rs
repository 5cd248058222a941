//! Session event stream types.
//!
//! Every session emits an ordered stream of [`SessionEvent`]s and ends with
//! exactly one terminal event: `Done`, or `Error` with `fatal: true`.
//! Events serialize to JSON with a `type` tag so a transport can forward them
//! unchanged.

use crate::compositor::MergeProgress;
use crate::render::RenderedClip;
use crate::types::{MatchCandidate, SilenceGap};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Session identifier
pub type SessionId = String;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Done,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// What a session is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Search,
    Silence,
    Merge,
}

/// One event on a session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,

    /// Position in the stream, starting at 0
    pub seq: u64,

    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Progress(Progress),
    Result(ResultEvent),
    Skipped(Skipped),
    Error(ErrorEvent),
    Done(DoneSummary),
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        match self {
            EventKind::Done(_) => true,
            EventKind::Error(e) => e.fatal,
            _ => false,
        }
    }
}

/// Where a session currently is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Group being processed, or the merge entry title
    pub phrase: String,

    /// 1-based position of `phrase`
    pub index: usize,
    pub total: usize,
    pub message: String,

    /// Merge stage details, for merge sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeProgress>,
}

/// A result bucket's matches so far.
///
/// Each event for a bucket carries every match rendered up to that point,
/// so consumers replace the previous state for `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Raw text of the originating group (or the silence range)
    pub phrase: String,

    /// Bucket label (window text or silence bucket)
    pub label: String,
    pub word_count: usize,
    pub is_partial: bool,
    pub matches: Vec<MatchPayload>,
}

/// Tagged result payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MatchPayload {
    Phrase {
        candidate: MatchCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clip: Option<RenderedClip>,
    },
    Silence {
        gap: SilenceGap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clip: Option<RenderedClip>,
    },
    Merged {
        output: PathBuf,
        clips: usize,
    },
}

impl MatchPayload {
    pub fn clip(&self) -> Option<&RenderedClip> {
        match self {
            MatchPayload::Phrase { clip, .. } | MatchPayload::Silence { clip, .. } => clip.as_ref(),
            MatchPayload::Merged { .. } => None,
        }
    }
}

/// Rendering of a phrase was abandoned on request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skipped {
    pub phrase: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,

    /// Fatal errors end the stream
    pub fatal: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
}

/// Aggregates carried by the terminal `done` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneSummary {
    /// Matches delivered in `result` events
    pub total_results: usize,

    /// Buckets delivered in `result` events
    pub total_buckets: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
    pub cancelled: bool,
}

/// Reply to a control signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: SessionId,
    pub accepted: bool,
    pub message: String,
}

impl Ack {
    pub fn accepted(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Ack {
            session_id: session_id.into(),
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Ack {
            session_id: session_id.into(),
            accepted: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let event = SessionEvent {
            session_id: "s-1".to_string(),
            seq: 3,
            kind: EventKind::Done(DoneSummary::default()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["session_id"], "s-1");
        assert_eq!(json["total_results"], 0);
        assert_eq!(json["cancelled"], false);

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_terminal_events() {
        let fatal = EventKind::Error(ErrorEvent {
            message: "boom".to_string(),
            fatal: true,
            phrase: None,
        });
        let soft = EventKind::Error(ErrorEvent {
            message: "one clip failed".to_string(),
            fatal: false,
            phrase: Some("hello".to_string()),
        });
        assert!(fatal.is_terminal());
        assert!(!soft.is_terminal());
        assert!(EventKind::Done(DoneSummary::default()).is_terminal());
    }

    #[test]
    fn test_payload_tag() {
        let payload = MatchPayload::Merged {
            output: PathBuf::from("out.mp4"),
            clips: 2,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "merged");
    }
}
