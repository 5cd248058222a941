//! Clip rendering.
//!
//! A [`RenderJob`] names a source file, the *original* boundaries of a
//! segment and the trims to apply to them. Because jobs always start from the
//! original boundaries, adjusting a trim repeatedly never compounds.
//!
//! The actual transcoding is delegated to a [`Transcoder`]. Hardware encodes
//! are gated by the shared [`EncodePool`]; when a hardware encode fails the
//! slot is released and the job is retried once in software.

mod ffmpeg;
mod pool;

pub use ffmpeg::{FfmpegSettings, FfmpegTranscoder};
pub use pool::{EncodePermit, EncodePool, DEFAULT_HARDWARE_SLOTS};

use crate::error::{PhrasecutError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Slowest playback speed accepted
pub const MIN_SPEED: f64 = 0.5;

/// Fastest playback speed accepted
pub const MAX_SPEED: f64 = 1.0;

/// Padding added around search matches before they are rendered
pub const DEFAULT_CLIP_PADDING: f64 = 0.45;

/// Which encoder a transcode runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Hardware,
    Software,
}

/// Output quality profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "lowercase")]
pub enum Quality {
    /// Fast encode for browsing results
    Preview { fps: f64 },

    /// Constant frame rate, high quality encode for merging
    Master {
        fps: u32,
        crf: u8,
        audio_bitrate: String,
    },
}

/// One call into the external transcoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSpec {
    pub input: PathBuf,
    pub output: PathBuf,

    /// Seek position in the input, seconds
    pub start: f64,

    /// Length of input to consume, seconds
    pub duration: f64,

    /// Playback speed in `[MIN_SPEED, MAX_SPEED]`
    pub speed: f64,

    pub encoder: EncoderKind,
    pub quality: Quality,
}

/// External transcoding primitive.
///
/// Implementations must never modify `spec.input`.
pub trait Transcoder: Send + Sync {
    /// Produce `spec.output` from the described window of `spec.input`.
    fn transcode(&self, spec: &TranscodeSpec) -> anyhow::Result<()>;

    /// Duration of a media file in seconds.
    fn probe_duration(&self, path: &Path) -> anyhow::Result<f64>;

    /// Join `inputs` in order into `output`, re-encoding on `encoder`.
    fn concat(&self, inputs: &[PathBuf], output: &Path, encoder: EncoderKind) -> anyhow::Result<()>;

    /// Whether a hardware encoder is available at all
    fn supports_hardware(&self) -> bool {
        false
    }
}

/// A request to materialize one trimmed clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub source_file: PathBuf,

    /// Untrimmed segment start, seconds
    pub original_start: f64,

    /// Untrimmed segment end, seconds
    pub original_end: f64,

    /// Milliseconds cut from the start; negative values extend the clip
    #[serde(default)]
    pub start_trim_ms: i64,

    /// Milliseconds cut from the end; negative values extend the clip
    #[serde(default)]
    pub end_trim_ms: i64,

    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Explicit output path; derived from the job when absent
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

fn default_speed() -> f64 {
    1.0
}

impl RenderJob {
    pub fn new(source_file: impl Into<PathBuf>, original_start: f64, original_end: f64) -> Self {
        RenderJob {
            source_file: source_file.into(),
            original_start,
            original_end,
            start_trim_ms: 0,
            end_trim_ms: 0,
            speed: 1.0,
            output_path: None,
        }
    }

    pub fn with_trim(mut self, start_trim_ms: i64, end_trim_ms: i64) -> Self {
        self.start_trim_ms = start_trim_ms;
        self.end_trim_ms = end_trim_ms;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_output(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(output_path.into());
        self
    }

    /// True when the job leaves the original segment untouched
    pub fn is_passthrough(&self) -> bool {
        self.start_trim_ms == 0 && self.end_trim_ms == 0 && clamp_speed(self.speed) == 1.0
    }

    /// The trimmed window before clamping to the source duration.
    pub fn window(&self) -> (f64, f64) {
        (
            self.original_start + self.start_trim_ms as f64 / 1000.0,
            self.original_end - self.end_trim_ms as f64 / 1000.0,
        )
    }

    /// Deterministic file name for this job.
    ///
    /// `<stem>_<startms>_<endms>[_trimmed_<s>_<e>][_x<speed%>].mp4`
    pub fn output_file_name(&self) -> String {
        let stem = self
            .source_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip".to_string());
        let stem = strip_trim_suffix(&stem);

        let mut name = format!(
            "{}_{}_{}",
            stem,
            to_millis(self.original_start),
            to_millis(self.original_end)
        );
        if self.start_trim_ms != 0 || self.end_trim_ms != 0 {
            name.push_str(&format!("_trimmed_{}_{}", self.start_trim_ms, self.end_trim_ms));
        }
        let speed = clamp_speed(self.speed);
        if speed != 1.0 {
            name.push_str(&format!("_x{}", (speed * 100.0).round() as u32));
        }
        name.push_str(".mp4");
        name
    }
}

/// A materialized clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedClip {
    pub clip_path: PathBuf,
    pub source_file: PathBuf,
    pub original_start: f64,
    pub original_end: f64,

    /// Window actually cut from the source
    pub start: f64,
    pub end: f64,

    pub speed: f64,
    pub encoder: EncoderKind,
}

impl RenderedClip {
    /// Playback length of the clip
    pub fn duration(&self) -> f64 {
        (self.end - self.start) / self.speed
    }
}

/// Settings for a [`ClipRenderer`]
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    /// Directory derived output names are placed in
    pub output_dir: PathBuf,

    /// Try the hardware path first when the transcoder supports it
    pub use_hardware: bool,

    pub quality: Quality,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            output_dir: std::env::temp_dir().join("phrasecut"),
            use_hardware: true,
            quality: Quality::Preview { fps: 25.0 },
        }
    }
}

/// Renders jobs through a transcoder and the shared encode pool.
#[derive(Clone)]
pub struct ClipRenderer {
    transcoder: Arc<dyn Transcoder>,
    pool: EncodePool,
    settings: RenderSettings,
}

impl ClipRenderer {
    pub fn new(transcoder: Arc<dyn Transcoder>, pool: EncodePool, settings: RenderSettings) -> Self {
        ClipRenderer {
            transcoder,
            pool,
            settings,
        }
    }

    pub fn transcoder(&self) -> &Arc<dyn Transcoder> {
        &self.transcoder
    }

    pub fn pool(&self) -> &EncodePool {
        &self.pool
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Same renderer writing to another directory
    pub fn with_output_dir(&self, output_dir: impl Into<PathBuf>) -> Self {
        let mut renderer = self.clone();
        renderer.settings.output_dir = output_dir.into();
        renderer
    }

    /// Same renderer with another quality profile
    pub fn with_quality(&self, quality: Quality) -> Self {
        let mut renderer = self.clone();
        renderer.settings.quality = quality;
        renderer
    }

    /// Where `job` will be written
    pub fn output_path(&self, job: &RenderJob) -> PathBuf {
        job.output_path
            .clone()
            .unwrap_or_else(|| self.settings.output_dir.join(job.output_file_name()))
    }

    /// Render one job.
    ///
    /// Blocks for a hardware slot when the hardware path is enabled. Fails
    /// with [`PhrasecutError::InvalidInput`] for an empty window and with
    /// [`PhrasecutError::Render`] when both encoder paths fail.
    #[instrument(skip(self, job), fields(file = %job.source_file.display()))]
    pub fn render(&self, job: &RenderJob) -> Result<RenderedClip> {
        let (mut start, mut end) = job.window();
        if !start.is_finite() || !end.is_finite() || end <= start {
            return Err(PhrasecutError::invalid_input(format!(
                "empty clip window {:.3}..{:.3}",
                start, end
            )));
        }

        start = start.max(0.0);
        match self.transcoder.probe_duration(&job.source_file) {
            Ok(total) if total > 0.0 => {
                start = start.min(total);
                end = end.min(total);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Could not probe source duration"),
        }
        if end <= start {
            return Err(PhrasecutError::invalid_input(format!(
                "clip window {:.3}..{:.3} lies outside the source",
                job.window().0,
                job.window().1
            )));
        }

        let output = self.output_path(job);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut spec = TranscodeSpec {
            input: job.source_file.clone(),
            output: output.clone(),
            start,
            duration: end - start,
            speed: clamp_speed(job.speed),
            encoder: EncoderKind::Software,
            quality: self.settings.quality.clone(),
        };

        let encoder = self
            .with_fallback(&output, |encoder| {
                spec.encoder = encoder;
                self.transcoder.transcode(&spec)
            })
            .map_err(|e| PhrasecutError::Render {
                source_file: job.source_file.clone(),
                start,
                end,
                reason: format!("{:#}", e),
            })?;

        Ok(RenderedClip {
            clip_path: spec.output,
            source_file: job.source_file.clone(),
            original_start: job.original_start,
            original_end: job.original_end,
            start,
            end,
            speed: spec.speed,
            encoder,
        })
    }

    /// Join `inputs` into `output` with the same slot and fallback rules as
    /// [`ClipRenderer::render`].
    #[instrument(skip(self, inputs), fields(output = %output.display(), clips = inputs.len()))]
    pub fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<EncoderKind> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.with_fallback(output, |encoder| self.transcoder.concat(inputs, output, encoder))
            .map_err(|e| PhrasecutError::Concat {
                output: output.to_path_buf(),
                reason: format!("{:#}", e),
            })
    }

    /// Run `encode` on a pooled hardware slot when enabled, then once more in
    /// software if that fails.
    fn with_fallback(
        &self,
        output: &Path,
        mut encode: impl FnMut(EncoderKind) -> anyhow::Result<()>,
    ) -> anyhow::Result<EncoderKind> {
        if self.settings.use_hardware && self.transcoder.supports_hardware() {
            let permit = self.pool.acquire();
            let attempt = encode(EncoderKind::Hardware);
            drop(permit);

            match attempt {
                Ok(()) => return Ok(EncoderKind::Hardware),
                Err(e) => {
                    warn!(output = %output.display(), error = %e, "Hardware encode failed, retrying in software");
                }
            }
        }

        encode(EncoderKind::Software)?;
        Ok(EncoderKind::Software)
    }
}

impl std::fmt::Debug for ClipRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipRenderer")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Clamp a playback speed into the supported range; non-finite means 1.0.
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

fn to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

/// Remove trailing `_trimmed_<s>_<e>` groups from a file stem.
pub fn strip_trim_suffix(stem: &str) -> String {
    match Regex::new(r"(?:_trimmed_-?\d+_-?\d+)+$") {
        Ok(re) => re.replace(stem, "").into_owned(),
        Err(_) => stem.to_string(),
    }
}

/// Lowercase ASCII slug of at most `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > max_len {
        slug.truncate(max_len);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "entry".to_string()
    } else {
        slug
    }
}

/// Stable directory name for the clips of one search.
///
/// `<slug>-<crc32(phrase)>-<crc32(sorted files)>`; the same phrase over the
/// same files always lands in the same directory.
pub fn clip_group_name(prefix: &str, phrase: &str, files: &[PathBuf]) -> String {
    let slug = slugify(&format!("{}-{}", prefix, phrase), 40);

    let phrase_hash = if phrase.is_empty() {
        "nophrase".to_string()
    } else {
        format!("{:08x}", crc32fast::hash(phrase.to_lowercase().as_bytes()))
    };

    let file_hash = if files.is_empty() {
        "nofiles".to_string()
    } else {
        let mut names: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        names.sort();
        format!("{:08x}", crc32fast::hash(names.join("\n").as_bytes()))
    };

    format!("{}-{}-{}", slug, phrase_hash, file_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTranscoder;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn renderer(fake: &Arc<FakeTranscoder>, dir: &Path, slots: usize) -> ClipRenderer {
        ClipRenderer::new(
            fake.clone(),
            EncodePool::new(slots),
            RenderSettings {
                output_dir: dir.to_path_buf(),
                use_hardware: true,
                quality: Quality::Preview { fps: 25.0 },
            },
        )
    }

    #[test]
    fn test_output_file_name() {
        let job = RenderJob::new("/lib/talk.mp4", 1.25, 3.5);
        assert_eq!(job.output_file_name(), "talk_1250_3500.mp4");

        let job = job.with_trim(100, -200).with_speed(0.75);
        assert_eq!(job.output_file_name(), "talk_1250_3500_trimmed_100_-200_x75.mp4");

        let job = RenderJob::new("/lib/talk_trimmed_1_2_trimmed_3_4.mp4", 0.0, 1.0).with_trim(5, 6);
        assert_eq!(job.output_file_name(), "talk_0_1000_trimmed_5_6.mp4");
    }

    #[test]
    fn test_trims_start_from_original_boundaries() {
        let job = RenderJob::new("a.mp4", 10.0, 20.0).with_trim(500, 1000);
        assert_eq!(job.window(), (10.5, 19.0));
        // Adjusting again replaces, never compounds
        let job = job.with_trim(250, 0);
        assert_eq!(job.window(), (10.25, 20.0));
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(0.1), 0.5);
        assert_eq!(clamp_speed(2.0), 1.0);
        assert_eq!(clamp_speed(0.8), 0.8);
        assert_eq!(clamp_speed(f64::NAN), 1.0);
    }

    #[test]
    fn test_clip_group_name_is_stable() {
        let a = clip_group_name("phrase", "Hello World", &[PathBuf::from("b.mp4"), PathBuf::from("a.mp4")]);
        let b = clip_group_name("phrase", "hello world", &[PathBuf::from("a.mp4"), PathBuf::from("b.mp4")]);
        assert_eq!(a, b);
        assert!(a.starts_with("phrase-hello-world-"));
        assert!(clip_group_name("silence", "", &[]).ends_with("-nophrase-nofiles"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  Hello, World!  ", 40), "hello-world");
        assert_eq!(slugify("!!!", 40), "entry");
        assert_eq!(slugify("abc def ghi", 5), "abc-d");
        assert_eq!(slugify("abcd efgh", 5), "abcd");
    }

    #[test]
    fn test_render_passthrough_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().with_duration(60.0));
        let renderer = renderer(&fake, dir.path(), 2);
        let job = RenderJob::new("a.mp4", 1.0, 2.0);

        let first = renderer.render(&job).unwrap();
        let second = renderer.render(&job).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.start, 1.0);
        assert_eq!(first.end, 2.0);

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[test]
    fn test_window_clamped_to_source() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().with_duration(5.0));
        let renderer = renderer(&fake, dir.path(), 2);

        let clip = renderer.render(&RenderJob::new("a.mp4", 4.0, 9.0)).unwrap();
        assert_eq!(clip.end, 5.0);

        let err = renderer.render(&RenderJob::new("a.mp4", 6.0, 9.0)).unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));

        let err = renderer
            .render(&RenderJob::new("a.mp4", 1.0, 2.0).with_trim(600, 600))
            .unwrap_err();
        assert!(matches!(err, PhrasecutError::InvalidInput { .. }));
    }

    #[test]
    fn test_hardware_failure_falls_back_to_software() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().with_hardware().fail_hardware());
        let renderer = renderer(&fake, dir.path(), 1);

        let clip = renderer.render(&RenderJob::new("a.mp4", 0.0, 1.0)).unwrap();
        assert_eq!(clip.encoder, EncoderKind::Software);
        assert_eq!(renderer.pool().active(), 0);

        let encoders: Vec<_> = fake.calls().iter().map(|c| c.encoder).collect();
        assert_eq!(encoders, vec![EncoderKind::Hardware, EncoderKind::Software]);
    }

    #[test]
    fn test_both_paths_failing_is_render_error() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::new().with_hardware().fail_hardware().fail_software());
        let renderer = renderer(&fake, dir.path(), 1);

        let err = renderer.render(&RenderJob::new("a.mp4", 0.0, 1.0)).unwrap_err();
        assert!(err.is_per_candidate());
    }

    #[test]
    fn test_hardware_concurrency_matches_pool_size() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeTranscoder::new()
                .with_hardware()
                .with_delay(Duration::from_millis(40)),
        );
        let renderer = renderer(&fake, dir.path(), 2);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let renderer = renderer.clone();
                thread::spawn(move || {
                    renderer.render(&RenderJob::new("a.mp4", i as f64, i as f64 + 1.0))
                })
            })
            .collect();

        for handle in handles {
            let clip = handle.join().unwrap().unwrap();
            assert_eq!(clip.encoder, EncoderKind::Hardware);
        }
        assert_eq!(fake.peak_hardware(), 2);
        assert_eq!(fake.calls().len(), 6);
    }
}
