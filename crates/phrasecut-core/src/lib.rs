//! # Phrasecut Core Library
//!
//! This crate finds spoken phrases and pauses in transcribed video files and
//! cuts them into clips. Everything that touches the outside world sits
//! behind a trait: transcripts come from a [`TranscriptProvider`] and video
//! work goes through a [`Transcoder`].
//!
//! ## Architecture
//!
//! - **Transcripts** (`provider`, `subtitle`): load word timings from sidecar files
//! - **Index** (`index`): flattened, cached transcripts for a set of files
//! - **Query** (`query`): split a query into groups and partial windows
//! - **Matcher** (`matcher`): locate and rank phrase matches
//! - **Silence** (`silence`): find and bucket pauses between words
//! - **Render** (`render`): trimmed clips through ffmpeg with a shared hardware pool
//! - **Compositor** (`compositor`): render and join a timeline
//! - **Sessions** (`session`, `events`): streaming requests with cancel and skip
//! - **Config** (`config`): configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use phrasecut_core::{Config, SearchRequest, SessionManager};
//!
//! let manager = SessionManager::from_config(&Config::load()?)?;
//! let request = SearchRequest::new(vec!["talk.mp4".into()], "hello world; thank you");
//! for event in manager.start_search(request)? {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod cancel;
pub mod compositor;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod matcher;
pub mod provider;
pub mod query;
pub mod render;
pub mod session;
pub mod silence;
pub mod subtitle;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use compositor::{ClipOrigin, ClipSource, Compositor, MergeOutcome, MergeProgress, MergeStage, TimelineEntry};
pub use config::Config;
pub use error::{PhrasecutError, Result};
pub use events::{Ack, DoneSummary, EventKind, MatchPayload, SessionEvent, SessionId, SessionKind, SessionStatus};
pub use index::{CorpusIndex, CorpusStats, IndexedTranscript, SentenceEntry};
pub use matcher::{MatchOptions, ResultBucket};
pub use provider::{FileTranscriptProvider, MemoryTranscriptProvider, TranscriptProvider};
pub use query::{PlanOptions, SearchGroup};
pub use render::{ClipRenderer, EncodePool, FfmpegTranscoder, Quality, RenderJob, RenderSettings, RenderedClip, Transcoder};
pub use session::{
    EventStream, MergeRequest, SearchOptions, SearchRequest, SessionInfo, SessionManager, SessionSettings,
    SilenceSearchRequest,
};
pub use types::{MatchCandidate, SilenceConstraint, SilenceGap, Transcript, Word};
