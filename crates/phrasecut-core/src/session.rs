//! Streaming session orchestration.
//!
//! A [`SessionManager`] turns search, silence and merge requests into
//! background sessions. Each session writes [`SessionEvent`]s into a bounded
//! channel that the caller drains through an [`EventStream`], and ends with
//! exactly one terminal event (`done`, or a fatal `error`).
//!
//! Sessions react to two signals between units of work:
//!
//! - `cancel`: no new group, bucket or render is started. Renders already
//!   handed to the transcoder run to completion, but at most one of them
//!   still emits its result.
//! - `skip`: the remaining renders of a phrase are abandoned and a `skipped`
//!   event takes the place of its result.

use crate::cancel::CancelToken;
use crate::compositor::{Compositor, MergeProgress, TimelineEntry};
use crate::config::Config;
use crate::error::{PhrasecutError, Result};
use crate::events::{
    Ack, DoneSummary, ErrorEvent, EventKind, MatchPayload, Progress, ResultEvent, SessionEvent,
    SessionId, SessionKind, SessionStatus, Skipped,
};
use crate::index::CorpusIndex;
use crate::matcher::{self, MatchOptions};
use crate::provider::FileTranscriptProvider;
use crate::query::{self, PlanOptions};
use crate::render::{
    clip_group_name, ClipRenderer, EncodePool, FfmpegSettings, FfmpegTranscoder, Quality,
    RenderJob, RenderSettings, RenderedClip, DEFAULT_CLIP_PADDING,
};
use crate::silence;
use crate::types::{MatchCandidate, SilenceConstraint, SilenceGap};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Events buffered per session before the producer waits for the consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

const SEND_RETRY: Duration = Duration::from_millis(2);

/// Phrase reported by merge sessions
const MERGE_PHRASE: &str = "timeline";

// ============================================================================
// Requests
// ============================================================================

/// Tuning for a phrase search.
///
/// Fields left out of a serialized request fall back to the built-in
/// defaults; use [`SearchOptions::from_config`] to seed them from a
/// configuration file instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub min_silence: f64,
    pub max_silence: f64,

    /// Matches with at most this many words must pass the pause check
    pub word_count_threshold: usize,

    pub max_results_per_segment: usize,
    pub allow_partial: bool,
    pub allow_all_partial: bool,
    pub partial_min_words: usize,

    /// Render a clip for every match, or stream bare matches
    pub render_clips: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions::from_config(&Config::default())
    }
}

impl SearchOptions {
    pub fn from_config(config: &Config) -> Self {
        SearchOptions {
            min_silence: config.search.min_silence,
            max_silence: config.search.max_silence,
            word_count_threshold: config.search.silence_word_threshold,
            max_results_per_segment: config.search.max_results_per_segment,
            allow_partial: false,
            allow_all_partial: false,
            partial_min_words: config.search.partial_min_words,
            render_clips: true,
        }
    }

    pub fn silence(&self) -> SilenceConstraint {
        SilenceConstraint::new(self.min_silence, self.max_silence, self.word_count_threshold)
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            silence: self.silence(),
            max_results: self.max_results_per_segment,
        }
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            allow_partial: self.allow_partial,
            allow_all_partial: self.allow_all_partial,
            partial_min_words: self.partial_min_words,
        }
    }
}

/// Search `files` for the `;`-separated phrases of `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub files: Vec<PathBuf>,
    pub query: String,

    #[serde(flatten)]
    pub options: SearchOptions,
}

impl SearchRequest {
    pub fn new(files: Vec<PathBuf>, query: impl Into<String>) -> Self {
        SearchRequest {
            files,
            query: query.into(),
            options: SearchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Find pauses between `min_silence` and `max_silence` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceSearchRequest {
    pub files: Vec<PathBuf>,
    pub min_silence: f64,
    pub max_silence: f64,

    #[serde(default = "default_max_results")]
    pub max_results_per_segment: usize,

    #[serde(default = "default_true")]
    pub render_clips: bool,
}

fn default_max_results() -> usize {
    matcher::DEFAULT_MAX_RESULTS
}

fn default_true() -> bool {
    true
}

impl SilenceSearchRequest {
    pub fn new(files: Vec<PathBuf>, min_silence: f64, max_silence: f64) -> Self {
        SilenceSearchRequest {
            files,
            min_silence,
            max_silence,
            max_results_per_segment: default_max_results(),
            render_clips: true,
        }
    }

    fn label(&self) -> String {
        format!("{:.2}-{:.2}s", self.min_silence, self.max_silence)
    }
}

/// Render and join a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub entries: Vec<TimelineEntry>,

    /// Where the merged file goes (None = `<output dir>/merged`)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl MergeRequest {
    pub fn new(entries: Vec<TimelineEntry>) -> Self {
        MergeRequest {
            entries,
            output_dir: None,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Settings shared by every session of a manager
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Root directory for clip groups and merges
    pub output_dir: PathBuf,

    /// Concurrent renders per result bucket
    pub workers: usize,

    /// Seconds added around search matches before rendering
    pub clip_padding: f64,

    pub channel_capacity: usize,

    /// Quality profile for merges
    pub master_quality: Quality,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            output_dir: std::env::temp_dir().join("phrasecut"),
            workers: 4,
            clip_padding: DEFAULT_CLIP_PADDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            master_quality: Config::default().master_quality(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(SessionSettings {
            output_dir: config.output_dir()?,
            workers: config.render_workers(),
            clip_padding: config.render.clip_padding_sec.max(0.0),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            master_quality: config.master_quality(),
        })
    }
}

/// Snapshot of a running session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,

    /// Phrases the session was asked to skip
    pub skipped: Vec<String>,
}

/// Starts sessions and routes control signals to them.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    index: Arc<CorpusIndex>,
    renderer: ClipRenderer,
    settings: SessionSettings,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(index: Arc<CorpusIndex>, renderer: ClipRenderer, settings: SessionSettings) -> Self {
        SessionManager {
            inner: Arc::new(ManagerInner {
                index,
                renderer,
                settings,
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Wire sidecar transcripts and ffmpeg from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let index = Arc::new(CorpusIndex::new(Arc::new(FileTranscriptProvider::new()?)));
        let transcoder = Arc::new(FfmpegTranscoder::new(FfmpegSettings::from_config(config)));
        let settings = SessionSettings::from_config(config)?;
        let renderer = ClipRenderer::new(
            transcoder,
            EncodePool::new(config.render.hardware_slots),
            RenderSettings {
                output_dir: settings.output_dir.clone(),
                use_hardware: config.render.hardware_encoder.is_some(),
                quality: config.preview_quality(),
            },
        );
        Ok(SessionManager::new(index, renderer, settings))
    }

    pub fn index(&self) -> &Arc<CorpusIndex> {
        &self.inner.index
    }

    pub fn renderer(&self) -> &ClipRenderer {
        &self.inner.renderer
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Start a phrase search.
    ///
    /// Rejects an empty query or file list before any session exists. A
    /// query without matchable words still gets a session that finishes
    /// immediately.
    pub fn start_search(&self, request: SearchRequest) -> Result<EventStream> {
        if request.files.is_empty() {
            return Err(PhrasecutError::invalid_input("no files selected"));
        }
        if request.query.trim().is_empty() {
            return Err(PhrasecutError::invalid_input("empty query"));
        }
        check_range(request.options.min_silence, request.options.max_silence)?;

        self.launch(SessionKind::Search, move |inner, handle| {
            inner.run_search(handle, &request)
        })
    }

    /// Start a pause search.
    pub fn start_silence_search(&self, request: SilenceSearchRequest) -> Result<EventStream> {
        if request.files.is_empty() {
            return Err(PhrasecutError::invalid_input("no files selected"));
        }
        check_range(request.min_silence, request.max_silence)?;

        self.launch(SessionKind::Silence, move |inner, handle| {
            inner.run_silence(handle, &request)
        })
    }

    /// Start a timeline merge.
    pub fn start_merge(&self, request: MergeRequest) -> Result<EventStream> {
        if !request.entries.iter().any(|e| e.enabled) {
            return Err(PhrasecutError::invalid_input("no enabled timeline entries"));
        }

        self.launch(SessionKind::Merge, move |inner, handle| {
            inner.run_merge(handle, &request)
        })
    }

    /// Render a single job outside any session.
    pub fn render(&self, job: &RenderJob) -> Result<RenderedClip> {
        self.inner.renderer.render(job)
    }

    /// Ask a session to stop. Finished and unknown sessions are acknowledged.
    pub fn cancel(&self, session_id: &str) -> Ack {
        match self.handle(session_id) {
            Some(handle) => {
                handle.request_cancel();
                info!(session = %session_id, "Cancel requested");
                Ack::accepted(session_id, "cancel requested")
            }
            None => Ack::accepted(session_id, "session already finished"),
        }
    }

    /// Abandon the remaining renders of `phrase` in a running session.
    pub fn skip(&self, session_id: &str, phrase: &str) -> Ack {
        let key = skip_key(phrase);
        if key.is_empty() {
            return Ack::rejected(session_id, "empty phrase");
        }
        match self.handle(session_id) {
            Some(handle) => {
                handle.skipped.lock().insert(key);
                info!(session = %session_id, phrase, "Skip requested");
                Ack::accepted(session_id, format!("skipping \"{}\"", phrase.trim()))
            }
            None => Ack::rejected(session_id, "unknown session"),
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionInfo> {
        self.handle(session_id).map(|h| h.info())
    }

    /// Running sessions, oldest first
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn launch<F>(&self, kind: SessionKind, work: F) -> Result<EventStream>
    where
        F: FnOnce(&ManagerInner, &SessionHandle) -> Result<DoneSummary> + Send + 'static,
    {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", kind_prefix(kind), n);
        let (tx, rx) = crossbeam_channel::bounded(self.inner.settings.channel_capacity.max(1));

        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            kind,
            started_at: Utc::now(),
            cancel: CancelToken::new(),
            skipped: Mutex::new(HashSet::new()),
            status: Mutex::new(SessionStatus::Running),
            tx,
            seq: Mutex::new(0),
            trailing_sent: AtomicBool::new(false),
        });
        self.inner.sessions.insert(id.clone(), Arc::clone(&handle));

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || inner.run(&handle, work));

        if let Err(e) = spawned {
            self.inner.sessions.remove(&id);
            return Err(PhrasecutError::session(
                id,
                format!("could not start session thread: {}", e),
            ));
        }

        debug!(session = %id, ?kind, "Session started");
        Ok(EventStream {
            session_id: id,
            rx,
            finished: false,
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.sessions.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

fn kind_prefix(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Search => "search",
        SessionKind::Silence => "silence",
        SessionKind::Merge => "merge",
    }
}

fn check_range(min: f64, max: f64) -> Result<()> {
    if !min.is_finite() || !max.is_finite() || min < 0.0 || max < min {
        return Err(PhrasecutError::invalid_input(format!(
            "invalid silence range {}..{}",
            min, max
        )));
    }
    Ok(())
}

fn skip_key(phrase: &str) -> String {
    phrase.trim().to_lowercase()
}

// ============================================================================
// Session state
// ============================================================================

struct SessionHandle {
    id: SessionId,
    kind: SessionKind,
    started_at: DateTime<Utc>,
    cancel: CancelToken,
    skipped: Mutex<HashSet<String>>,
    status: Mutex<SessionStatus>,
    tx: Sender<SessionEvent>,

    /// Next sequence number; also serializes sends against cancellation
    seq: Mutex<u64>,

    /// Set once a result has gone out after cancellation
    trailing_sent: AtomicBool,
}

/// What a send is checked against while holding the sequence lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendGate {
    Always,
    UnlessCancelled,
    /// One result may still go out after cancellation, no more
    Trailing,
}

impl SessionHandle {
    fn emit(&self, kind: EventKind) -> bool {
        self.send(kind, SendGate::Always)
    }

    /// Emit unless the session was cancelled, atomically with respect to
    /// [`SessionHandle::request_cancel`].
    fn emit_unless_cancelled(&self, kind: EventKind) -> bool {
        self.send(kind, SendGate::UnlessCancelled)
    }

    /// Emit a result. Once cancelled, only the first result still goes out.
    fn emit_result(&self, event: ResultEvent) -> bool {
        self.send(EventKind::Result(event), SendGate::Trailing)
    }

    fn send(&self, mut kind: EventKind, gate: SendGate) -> bool {
        loop {
            {
                let mut seq = self.seq.lock();
                let cancelled = self.cancel.is_cancelled();
                match gate {
                    SendGate::UnlessCancelled if cancelled => return false,
                    SendGate::Trailing if cancelled && self.trailing_sent.load(Ordering::Acquire) => {
                        return false
                    }
                    _ => {}
                }
                let event = SessionEvent {
                    session_id: self.id.clone(),
                    seq: *seq,
                    kind,
                };
                match self.tx.try_send(event) {
                    Ok(()) => {
                        *seq += 1;
                        if gate == SendGate::Trailing && cancelled {
                            self.trailing_sent.store(true, Ordering::Release);
                        }
                        return true;
                    }
                    Err(TrySendError::Full(event)) => kind = event.kind,
                    Err(TrySendError::Disconnected(_)) => {
                        // Nobody is listening any more
                        self.cancel.cancel();
                        return false;
                    }
                }
            }
            thread::sleep(SEND_RETRY);
        }
    }

    fn request_cancel(&self) {
        let _seq = self.seq.lock();
        self.cancel.cancel();
    }

    fn is_skipped(&self, keys: &[&str]) -> bool {
        let skipped = self.skipped.lock();
        !skipped.is_empty() && keys.iter().any(|k| skipped.contains(&skip_key(k)))
    }

    fn info(&self) -> SessionInfo {
        let mut skipped: Vec<String> = self.skipped.lock().iter().cloned().collect();
        skipped.sort();
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind,
            status: *self.status.lock(),
            started_at: self.started_at,
            skipped,
        }
    }
}

/// Receiving end of a session.
///
/// Iteration yields events in emission order and ends after the terminal
/// event. Dropping the stream cancels the session.
pub struct EventStream {
    session_id: SessionId,
    rx: Receiver<SessionEvent>,
    finished: bool,
}

impl EventStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv_timeout(timeout).ok()?;
        self.finished = event.is_terminal();
        Some(event)
    }
}

impl Iterator for EventStream {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().ok()?;
        self.finished = event.is_terminal();
        Some(event)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.session_id)
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// Session bodies
// ============================================================================

impl ManagerInner {
    #[instrument(skip_all, fields(session = %handle.id, kind = ?handle.kind))]
    fn run<F>(&self, handle: &SessionHandle, work: F)
    where
        F: FnOnce(&ManagerInner, &SessionHandle) -> Result<DoneSummary>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(self, handle)))
            .unwrap_or_else(|payload| {
                Err(PhrasecutError::session(
                    handle.id.clone(),
                    format!("worker panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        let (status, terminal) = match outcome {
            Ok(summary) => {
                info!(
                    results = summary.total_results,
                    skipped = summary.total_skipped,
                    errors = summary.total_errors,
                    cancelled = summary.cancelled,
                    "Session finished"
                );
                let status = if summary.cancelled {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Done
                };
                (status, EventKind::Done(summary))
            }
            Err(e) => {
                warn!(error = %e, "Session failed");
                (
                    SessionStatus::Error,
                    EventKind::Error(ErrorEvent {
                        message: e.to_string(),
                        fatal: true,
                        phrase: None,
                    }),
                )
            }
        };

        *handle.status.lock() = status;
        self.sessions.remove(&handle.id);
        handle.emit(terminal);
    }

    fn run_search(&self, handle: &SessionHandle, request: &SearchRequest) -> Result<DoneSummary> {
        let groups = query::plan(&request.query, request.options.plan_options());
        let transcripts = self.index.lookup(&request.files);
        let options = request.options.match_options();
        let mut summary = DoneSummary::default();

        debug!(
            groups = groups.len(),
            files = request.files.len(),
            indexed = transcripts.len(),
            "Searching"
        );

        for group in &groups {
            let progress = EventKind::Progress(Progress {
                phrase: group.raw_text.clone(),
                index: group.index + 1,
                total: groups.len(),
                message: format!(
                    "Searching for \"{}\" in {} files",
                    group.raw_text,
                    transcripts.len()
                ),
                merge: None,
            });
            if !handle.emit_unless_cancelled(progress) {
                break;
            }

            let buckets = match matcher::match_group(group, &transcripts, &options, &handle.cancel) {
                Ok(buckets) => buckets,
                Err(e) => {
                    warn!(group = group.index, error = %e, "Matching failed");
                    summary.total_errors += 1;
                    handle.emit(EventKind::Error(ErrorEvent {
                        message: e.to_string(),
                        fatal: false,
                        phrase: Some(group.raw_text.clone()),
                    }));
                    continue;
                }
            };
            if buckets.is_empty() {
                debug!(group = group.index, "No matches");
                continue;
            }

            let renderer = self.renderer.with_output_dir(
                self.settings
                    .output_dir
                    .join(clip_group_name("phrase", &group.raw_text, &request.files)),
            );

            for bucket in buckets {
                if handle.cancel.is_cancelled() {
                    break;
                }
                let keys = [group.raw_text.as_str(), bucket.label.as_str()];
                let mut event = ResultEvent {
                    phrase: group.raw_text.clone(),
                    label: bucket.label.clone(),
                    word_count: bucket.word_count,
                    is_partial: bucket.is_partial,
                    matches: Vec::new(),
                };
                if handle.is_skipped(&keys) {
                    emit_skipped(handle, &event, &mut summary);
                    continue;
                }

                if !request.options.render_clips {
                    event.matches = bucket
                        .candidates
                        .into_iter()
                        .map(|candidate| MatchPayload::Phrase {
                            candidate,
                            clip: None,
                        })
                        .collect();
                    let count = event.matches.len();
                    if handle.emit_result(event) {
                        summary.total_results += count;
                        summary.total_buckets += 1;
                    }
                    continue;
                }

                let jobs: Vec<(MatchCandidate, RenderJob)> = bucket
                    .candidates
                    .into_iter()
                    .map(|c| {
                        let job = self.padded_job(&c);
                        (c, job)
                    })
                    .collect();
                self.render_bucket(handle, &renderer, event, jobs, &keys, &mut summary, |candidate, clip| {
                    MatchPayload::Phrase {
                        candidate,
                        clip: Some(clip),
                    }
                });
            }
        }

        summary.cancelled = handle.cancel.is_cancelled();
        Ok(summary)
    }

    fn run_silence(
        &self,
        handle: &SessionHandle,
        request: &SilenceSearchRequest,
    ) -> Result<DoneSummary> {
        let phrase = request.label();
        let range = SilenceConstraint::new(request.min_silence, request.max_silence, 0);
        let mut summary = DoneSummary::default();

        let transcripts = self.index.lookup(&request.files);
        let progress = EventKind::Progress(Progress {
            phrase: phrase.clone(),
            index: 1,
            total: 1,
            message: format!("Scanning {} files for {} silences", transcripts.len(), phrase),
            merge: None,
        });
        if !handle.emit_unless_cancelled(progress) {
            summary.cancelled = true;
            return Ok(summary);
        }

        let gaps = silence::scan_ranked(
            &transcripts,
            &range,
            request.max_results_per_segment,
            &handle.cancel,
        );
        let buckets = silence::bucket(gaps, request.max_results_per_segment);
        let renderer = self.renderer.with_output_dir(
            self.settings
                .output_dir
                .join(clip_group_name("silence", &phrase, &request.files)),
        );

        for bucket in buckets {
            if handle.cancel.is_cancelled() {
                break;
            }
            let keys = [phrase.as_str(), bucket.label.as_str()];
            let mut event = ResultEvent {
                phrase: phrase.clone(),
                label: bucket.label.clone(),
                word_count: 0,
                is_partial: false,
                matches: Vec::new(),
            };
            if handle.is_skipped(&keys) {
                emit_skipped(handle, &event, &mut summary);
                continue;
            }

            if !request.render_clips {
                event.matches = bucket
                    .gaps
                    .into_iter()
                    .map(|gap| MatchPayload::Silence { gap, clip: None })
                    .collect();
                let count = event.matches.len();
                if handle.emit_result(event) {
                    summary.total_results += count;
                    summary.total_buckets += 1;
                }
                continue;
            }

            let jobs: Vec<(SilenceGap, RenderJob)> = bucket
                .gaps
                .into_iter()
                .map(|gap| {
                    let job = RenderJob::new(&gap.source_file, gap.start, gap.end);
                    (gap, job)
                })
                .collect();
            self.render_bucket(handle, &renderer, event, jobs, &keys, &mut summary, |gap, clip| {
                MatchPayload::Silence {
                    gap,
                    clip: Some(clip),
                }
            });
        }

        summary.cancelled = handle.cancel.is_cancelled();
        Ok(summary)
    }

    fn run_merge(&self, handle: &SessionHandle, request: &MergeRequest) -> Result<DoneSummary> {
        let output_dir = request
            .output_dir
            .clone()
            .unwrap_or_else(|| self.settings.output_dir.join("merged"));
        let compositor =
            Compositor::new(self.renderer.with_quality(self.settings.master_quality.clone()));
        let mut summary = DoneSummary::default();

        let outcome = compositor.merge(
            &request.entries,
            &output_dir,
            &handle.cancel,
            |progress: MergeProgress| {
                handle.emit(EventKind::Progress(Progress {
                    phrase: MERGE_PHRASE.to_string(),
                    index: progress.index.clamp(1, progress.total.max(1)),
                    total: progress.total,
                    message: progress.message.clone(),
                    merge: Some(progress),
                }));
            },
        )?;

        match outcome {
            Some(outcome) => {
                let label = outcome
                    .output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                summary.total_results = 1;
                summary.total_buckets = 1;
                handle.emit(EventKind::Result(ResultEvent {
                    phrase: MERGE_PHRASE.to_string(),
                    label,
                    word_count: 0,
                    is_partial: false,
                    matches: vec![MatchPayload::Merged {
                        clips: outcome.parts.len(),
                        output: outcome.output,
                    }],
                }));
            }
            None => summary.cancelled = true,
        }
        Ok(summary)
    }

    /// Render job covering a match plus the configured padding.
    fn padded_job(&self, candidate: &MatchCandidate) -> RenderJob {
        let pad = self.settings.clip_padding;
        RenderJob::new(
            &candidate.source_file,
            (candidate.start - pad).max(0.0),
            candidate.end + pad,
        )
    }

    /// Render one bucket, emitting a cumulative result per finished clip.
    #[allow(clippy::too_many_arguments)]
    fn render_bucket<T: Send>(
        &self,
        handle: &SessionHandle,
        renderer: &ClipRenderer,
        mut event: ResultEvent,
        jobs: Vec<(T, RenderJob)>,
        keys: &[&str],
        summary: &mut DoneSummary,
        to_payload: impl Fn(T, RenderedClip) -> MatchPayload,
    ) {
        let should_stop = || handle.cancel.is_cancelled() || handle.is_skipped(keys);
        let mut skipped = false;

        let stopped = render_all(self.settings.workers, renderer, jobs, &should_stop, |item, outcome| {
            if skipped || handle.is_skipped(keys) {
                skipped = true;
                return;
            }
            match outcome {
                Ok(clip) => {
                    event.matches.push(to_payload(item, clip));
                    if !handle.emit_result(event.clone()) {
                        event.matches.pop();
                    }
                }
                Err(e) => {
                    if e.is_per_candidate() {
                        warn!(phrase = %event.phrase, error = %e, "Clip render failed");
                    } else {
                        warn!(phrase = %event.phrase, error = %e, "Clip rejected");
                    }
                    summary.total_errors += 1;
                    handle.emit(EventKind::Error(ErrorEvent {
                        message: e.to_string(),
                        fatal: false,
                        phrase: Some(event.phrase.clone()),
                    }));
                }
            }
        });

        if !event.matches.is_empty() {
            summary.total_results += event.matches.len();
            summary.total_buckets += 1;
        }
        if skipped || (stopped && handle.is_skipped(keys)) {
            emit_skipped(handle, &event, summary);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn emit_skipped(handle: &SessionHandle, event: &ResultEvent, summary: &mut DoneSummary) {
    debug!(phrase = %event.phrase, label = %event.label, "Skipped");
    summary.total_skipped += 1;
    handle.emit(EventKind::Skipped(Skipped {
        phrase: event.phrase.clone(),
        label: event.label.clone(),
    }));
}

/// Run `jobs` on up to `workers` threads and hand each outcome to
/// `on_result` on the calling thread, in completion order.
///
/// `should_stop` is checked before each render starts. Returns true when it
/// stopped at least one job from starting.
fn render_all<T: Send>(
    workers: usize,
    renderer: &ClipRenderer,
    jobs: Vec<(T, RenderJob)>,
    should_stop: &(dyn Fn() -> bool + Sync),
    mut on_result: impl FnMut(T, Result<RenderedClip>),
) -> bool {
    if jobs.is_empty() {
        return false;
    }
    let workers = workers.clamp(1, jobs.len());

    let (job_tx, job_rx) = crossbeam_channel::unbounded();
    for job in jobs {
        // The receiver is alive, so this cannot fail
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let stopped = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let stopped = &stopped;
            scope.spawn(move || {
                for (item, job) in job_rx.iter() {
                    if should_stop() {
                        stopped.store(true, Ordering::Release);
                        break;
                    }
                    let outcome = renderer.render(&job);
                    if result_tx.send((item, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (item, outcome) in result_rx.iter() {
            on_result(item, outcome);
        }
    });

    stopped.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryTranscriptProvider;
    use crate::test_support::FakeTranscoder;
    use std::path::Path;
    use tempfile::TempDir;

    fn provider() -> Arc<MemoryTranscriptProvider> {
        let provider = Arc::new(MemoryTranscriptProvider::new());
        provider.insert_words(
            "a.mp4",
            &[("hello", 0.0, 0.5), ("world", 0.6, 1.1), ("foo", 1.2, 1.5)],
        );
        provider.insert_words(
            "b.mp4",
            &[
                ("hello", 0.0, 0.5),
                ("x", 0.6, 1.0),
                ("hello", 1.1, 1.6),
                ("y", 1.7, 2.0),
                ("hello", 2.1, 2.6),
            ],
        );
        provider.insert_words(
            "quiet.mp4",
            &[("one", 0.0, 1.0), ("two", 1.5, 2.0), ("three", 2.55, 3.0)],
        );
        provider
    }

    fn manager(fake: &Arc<FakeTranscoder>, dir: &Path, workers: usize) -> SessionManager {
        let index = Arc::new(CorpusIndex::new(provider()));
        let renderer = ClipRenderer::new(
            fake.clone(),
            EncodePool::new(2),
            RenderSettings {
                output_dir: dir.to_path_buf(),
                ..RenderSettings::default()
            },
        );
        SessionManager::new(
            index,
            renderer,
            SessionSettings {
                output_dir: dir.to_path_buf(),
                workers,
                ..SessionSettings::default()
            },
        )
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn done(events: &[SessionEvent]) -> &DoneSummary {
        match &events.last().unwrap().kind {
            EventKind::Done(summary) => summary,
            other => panic!("expected done, got {:?}", other),
        }
    }

    fn results(events: &[SessionEvent]) -> Vec<&ResultEvent> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_search_without_rendering() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let options = SearchOptions {
            render_clips: false,
            ..SearchOptions::default()
        };
        let request = SearchRequest::new(files(&["a.mp4"]), "hello world").with_options(options);
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();

        assert!(matches!(events[0].kind, EventKind::Progress(_)));
        let results = results(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "hello world");
        match &results[0].matches[0] {
            MatchPayload::Phrase { candidate, clip } => {
                assert_eq!(candidate.start, 0.0);
                assert_eq!(candidate.end, 1.1);
                assert!(clip.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(done(&events).total_results, 1);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_search_renders_padded_clips() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["a.mp4", "missing.mp4"]), "hello world");
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();

        let results = results(&events);
        assert_eq!(results.len(), 1);
        let clip = results[0].matches[0].clip().unwrap();
        assert_eq!(clip.start, 0.0);
        assert!((clip.end - 1.55).abs() < 1e-9);
        assert!(clip.clip_path.starts_with(dir.path()));
        assert_eq!(fake.calls().len(), 1);

        let summary = done(&events);
        assert_eq!(summary.total_results, 1);
        assert_eq!(summary.total_buckets, 1);
        assert!(!summary.cancelled);
    }

    #[test]
    fn test_results_are_cumulative() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["b.mp4"]), "hello");
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();

        let sizes: Vec<usize> = results(&events).iter().map(|r| r.matches.len()).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
        assert_eq!(done(&events).total_results, 3);

        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_matches() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["a.mp4"]), "nothing like this");
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();

        assert!(results(&events).is_empty());
        assert_eq!(done(&events), &DoneSummary::default());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_punctuation_only_query() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["a.mp4"]), "!!; ...");
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(done(&events).total_results, 0);
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let err = manager
            .start_search(SearchRequest::new(files(&["a.mp4"]), "  "))
            .unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));

        let err = manager
            .start_search(SearchRequest::new(Vec::new(), "hello"))
            .unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));

        let err = manager
            .start_silence_search(SilenceSearchRequest::new(files(&["a.mp4"]), 2.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));

        let mut entry = TimelineEntry::source("off", "a.mp4", 0.0, 1.0);
        entry.enabled = false;
        let err = manager.start_merge(MergeRequest::new(vec![entry])).unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));

        assert!(manager.active_sessions().is_empty());
    }

    #[test]
    fn test_render_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().fail_software());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["a.mp4"]), "hello world; foo");
        let events: Vec<SessionEvent> = manager.start_search(request).unwrap().collect();

        let errors: Vec<&ErrorEvent> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| !e.fatal));
        assert_eq!(errors[0].phrase.as_deref(), Some("hello world"));

        let summary = done(&events);
        assert_eq!(summary.total_errors, 2);
        assert_eq!(summary.total_results, 0);
    }

    #[test]
    fn test_cancel_stops_new_groups() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().held());
        let manager = manager(&fake, dir.path(), 1);

        let request = SearchRequest::new(files(&["a.mp4"]), "hello world; foo");
        let stream = manager.start_search(request).unwrap();
        let id = stream.session_id().to_string();

        assert!(fake.wait_for_calls(1, Duration::from_secs(5)));
        assert_eq!(manager.status(&id).unwrap().status, SessionStatus::Running);
        let ack = manager.cancel(&id);
        assert!(ack.accepted);
        fake.release();

        let events: Vec<SessionEvent> = stream.collect();
        let progress_after_first = events.iter().any(|e| {
            matches!(&e.kind, EventKind::Progress(p) if p.phrase == "foo")
        });
        assert!(!progress_after_first);
        assert!(done(&events).cancelled);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(fake.calls().len(), 1);

        assert!(manager.status(&id).is_none());
        assert!(manager.cancel(&id).accepted);
    }

    #[test]
    fn test_worker_panic_ends_session_with_fatal_error() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().panicking());
        let manager = manager(&fake, dir.path(), 2);

        let request = SearchRequest::new(files(&["a.mp4"]), "hello world");
        let stream = manager.start_search(request).unwrap();
        let id = stream.session_id().to_string();
        let events: Vec<SessionEvent> = stream.collect();

        let last = events.last().unwrap();
        assert!(matches!(&last.kind, EventKind::Error(e) if e.fatal && e.message.contains("panicked")));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(manager.status(&id).is_none());
        assert!(manager.active_sessions().is_empty());
    }

    #[test]
    fn test_cancel_lets_one_in_flight_result_through() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().held());
        let manager = manager(&fake, dir.path(), 3);

        let request = SearchRequest::new(files(&["b.mp4"]), "hello");
        let stream = manager.start_search(request).unwrap();
        let id = stream.session_id().to_string();

        // All three clips are inside the transcoder before the cancel lands
        assert!(fake.wait_for_calls(3, Duration::from_secs(5)));
        assert!(manager.cancel(&id).accepted);
        fake.release();

        let events: Vec<SessionEvent> = stream.collect();
        let results = results(&events);
        assert!(results.len() <= 1);

        let summary = done(&events);
        assert!(summary.cancelled);
        assert_eq!(
            summary.total_results,
            results.last().map_or(0, |r| r.matches.len())
        );
        assert_eq!(fake.calls().len(), 3);
    }

    #[test]
    fn test_skip_replaces_result() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().held());
        let manager = manager(&fake, dir.path(), 1);

        let request = SearchRequest::new(files(&["b.mp4"]), "hello");
        let stream = manager.start_search(request).unwrap();
        let id = stream.session_id().to_string();

        assert!(fake.wait_for_calls(1, Duration::from_secs(5)));
        assert!(manager.skip(&id, "Hello ").accepted);
        assert_eq!(manager.status(&id).unwrap().skipped, vec!["hello".to_string()]);
        fake.release();

        let events: Vec<SessionEvent> = stream.collect();
        assert!(results(&events).is_empty());
        let skipped: Vec<&Skipped> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Skipped(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].label, "hello");

        let summary = done(&events);
        assert_eq!(summary.total_skipped, 1);
        assert!(!summary.cancelled);
        assert_eq!(fake.calls().len(), 1);
    }

    #[test]
    fn test_control_signals_for_unknown_sessions() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 1);

        assert!(manager.cancel("search-99").accepted);
        assert!(!manager.skip("search-99", "hello").accepted);
        assert!(manager.status("search-99").is_none());
    }

    #[test]
    fn test_silence_search() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 2);

        let mut request = SilenceSearchRequest::new(files(&["quiet.mp4"]), 0.5, 0.6);
        request.render_clips = false;
        let events: Vec<SessionEvent> = manager.start_silence_search(request).unwrap().collect();

        let results = results(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "<1s silences");
        assert_eq!(results[0].matches.len(), 2);
        match &results[0].matches[0] {
            MatchPayload::Silence { gap, .. } => {
                assert_eq!(gap.word_before, "two");
                assert_eq!(gap.word_after, "three");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(done(&events).total_results, 2);
    }

    #[test]
    fn test_silence_clips_use_gap_bounds() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 1);

        let request = SilenceSearchRequest::new(files(&["quiet.mp4"]), 0.5, 0.52);
        let events: Vec<SessionEvent> = manager.start_silence_search(request).unwrap().collect();

        let results = results(&events);
        assert_eq!(results.len(), 1);
        let clip = results[0].matches[0].clip().unwrap();
        assert_eq!(clip.start, 1.0);
        assert_eq!(clip.end, 1.5);
    }

    #[test]
    fn test_merge_session() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new());
        let manager = manager(&fake, dir.path(), 1);

        let ready = dir.path().join("ready.mp4");
        std::fs::write(&ready, b"clip").unwrap();
        let mut request = MergeRequest::new(vec![
            TimelineEntry::source("first words", "a.mp4", 0.0, 1.0),
            TimelineEntry::rendered("second", &ready),
        ]);
        request.output_dir = Some(dir.path().join("out"));

        let events: Vec<SessionEvent> = manager.start_merge(request).unwrap().collect();
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::Progress(p) if p.merge.is_some())));

        let results = results(&events);
        assert_eq!(results.len(), 1);
        match &results[0].matches[0] {
            MatchPayload::Merged { output, clips } => {
                assert_eq!(*clips, 2);
                assert!(output.starts_with(dir.path().join("out")));
                assert!(output.exists());
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(fake.calls().len(), 1);
        assert!(matches!(
            fake.calls()[0].quality,
            Quality::Master { .. }
        ));
        assert_eq!(fake.concats().len(), 1);
    }

    #[test]
    fn test_merge_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().fail_software());
        let manager = manager(&fake, dir.path(), 1);

        let request = MergeRequest::new(vec![TimelineEntry::source("one", "a.mp4", 0.0, 1.0)]);
        let events: Vec<SessionEvent> = manager.start_merge(request).unwrap().collect();

        let last = events.last().unwrap();
        assert!(matches!(&last.kind, EventKind::Error(e) if e.fatal));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_search_options_from_config() {
        let mut config = Config::default();
        config.search.max_results_per_segment = 7;
        config.search.silence_word_threshold = 1;

        let options = SearchOptions::from_config(&config);
        assert_eq!(options.match_options().max_results, 7);
        assert_eq!(options.silence().word_count_threshold, 1);
        assert!(options.render_clips);

        let json = r#"{"files": ["a.mp4"], "query": "hi", "allow_partial": true}"#;
        let request: SearchRequest = serde_json::from_str(json).unwrap();
        assert!(request.options.allow_partial);
        assert_eq!(request.options.max_results_per_segment, 25);
    }
}
