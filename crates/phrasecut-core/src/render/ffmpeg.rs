//! `ffmpeg`/`ffprobe` backed [`Transcoder`].

use super::{EncoderKind, Quality, TranscodeSpec, Transcoder};
use crate::config::Config;
use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How the external tools are invoked
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegSettings {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,

    /// Hardware video encoder, e.g. `h264_nvenc`
    pub hardware_encoder: Option<String>,
    pub hardware_args: Vec<String>,

    /// Kill a run that takes longer than this
    pub timeout: Duration,

    /// Concat output encoding
    pub merge_fps: u32,
    pub merge_crf: u8,
    pub merge_audio_bitrate: String,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        FfmpegSettings {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            hardware_encoder: None,
            hardware_args: Vec::new(),
            timeout: Duration::from_secs(300),
            merge_fps: 30,
            merge_crf: 18,
            merge_audio_bitrate: "192k".to_string(),
        }
    }
}

impl FfmpegSettings {
    pub fn from_config(config: &Config) -> Self {
        FfmpegSettings {
            ffmpeg_path: config.render.ffmpeg_path.clone(),
            ffprobe_path: config.render.ffprobe_path.clone(),
            hardware_encoder: config
                .render
                .hardware_encoder
                .clone()
                .filter(|e| !e.trim().is_empty()),
            hardware_args: config.render.hardware_args.clone(),
            timeout: Duration::from_secs(config.render.timeout_sec.max(1)),
            merge_fps: config.merge.target_fps,
            merge_crf: config.merge.crf,
            merge_audio_bitrate: config.merge.audio_bitrate.clone(),
        }
    }
}

/// Runs `ffmpeg` and `ffprobe` as child processes.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    settings: FfmpegSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        FfmpegTranscoder { settings }
    }

    pub fn settings(&self) -> &FfmpegSettings {
        &self.settings
    }

    /// Arguments for one transcode, without the program name.
    pub fn transcode_args(&self, spec: &TranscodeSpec) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec!["-y".into(), "-v".into(), "error".into()];
        let speed_changed = spec.speed != 1.0;

        args.extend(["-ss".into(), format_seconds(spec.start)]);
        if speed_changed {
            // Input-side limit; the slowed output runs longer
            args.extend(["-t".into(), format_seconds(spec.duration)]);
        }
        args.extend(["-i".into(), spec.input.display().to_string()]);
        if !speed_changed {
            args.extend(["-t".into(), format_seconds(spec.duration)]);
        }

        if speed_changed {
            args.extend(["-vf".into(), format!("setpts=PTS/{}", spec.speed)]);
            args.extend(["-af".into(), format!("atempo={}", spec.speed)]);
        }

        args.extend(["-c:a".into(), "aac".into(), "-ac".into(), "2".into()]);

        match &spec.quality {
            Quality::Preview { fps } => {
                args.extend(["-r".into(), format!("{}", fps)]);
                args.extend(self.video_codec_args(spec.encoder, "ultrafast", None)?);
            }
            Quality::Master {
                fps,
                crf,
                audio_bitrate,
            } => {
                args.extend([
                    "-b:a".into(),
                    audio_bitrate.clone(),
                    "-vsync".into(),
                    "cfr".into(),
                    "-r".into(),
                    fps.to_string(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                ]);
                args.extend(self.video_codec_args(spec.encoder, "medium", Some(*crf))?);
            }
        }

        args.push(spec.output.display().to_string());
        Ok(args)
    }

    fn video_codec_args(
        &self,
        encoder: EncoderKind,
        preset: &str,
        crf: Option<u8>,
    ) -> Result<Vec<String>> {
        match encoder {
            EncoderKind::Hardware => {
                let codec = self
                    .settings
                    .hardware_encoder
                    .as_ref()
                    .ok_or_else(|| anyhow!("no hardware encoder configured"))?;
                let mut args = vec!["-c:v".to_string(), codec.clone()];
                args.extend(self.settings.hardware_args.iter().cloned());
                Ok(args)
            }
            EncoderKind::Software => {
                let mut args = vec![
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-preset".to_string(),
                    preset.to_string(),
                ];
                if let Some(crf) = crf {
                    args.extend(["-crf".to_string(), crf.to_string()]);
                }
                Ok(args)
            }
        }
    }

    fn run(&self, program: &Path, args: &[String]) -> Result<String> {
        trace!(program = %program.display(), ?args, "Spawning");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", program.display()))?;

        // Drain both pipes while waiting
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain(stdout));
        let stderr_reader = thread::spawn(move || drain(stderr));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() > self.settings.timeout {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "{} timed out after {}s",
                    program.display(),
                    self.settings.timeout.as_secs()
                );
            }
            thread::sleep(Duration::from_millis(25));
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let tail: String = stderr
                .chars()
                .rev()
                .take(500)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            bail!("{} failed ({}): {}", program.display(), status, tail.trim());
        }
        Ok(stdout)
    }
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let mut buf = Vec::new();
        if pipe.read_to_end(&mut buf).is_ok() {
            out = String::from_utf8_lossy(&buf).into_owned();
        }
    }
    out
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, spec: &TranscodeSpec) -> Result<()> {
        let args = self.transcode_args(spec)?;
        debug!(
            input = %spec.input.display(),
            output = %spec.output.display(),
            encoder = ?spec.encoder,
            "Transcoding clip"
        );
        self.run(&self.settings.ffmpeg_path, &args)?;

        if !spec.output.exists() {
            bail!("ffmpeg reported success but {} is missing", spec.output.display());
        }
        Ok(())
    }

    fn probe_duration(&self, path: &Path) -> Result<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.display().to_string(),
        ];
        let stdout = self.run(&self.settings.ffprobe_path, &args)?;
        stdout
            .trim()
            .parse::<f64>()
            .with_context(|| format!("Unexpected ffprobe output for {}", path.display()))
    }

    fn concat(&self, inputs: &[PathBuf], output: &Path, encoder: EncoderKind) -> Result<()> {
        if inputs.is_empty() {
            bail!("nothing to concatenate");
        }

        let list_path = output.with_extension("concat.txt");
        let mut list = String::new();
        for input in inputs {
            let absolute = std::fs::canonicalize(input)
                .with_context(|| format!("Missing clip {}", input.display()))?;
            let escaped = absolute.display().to_string().replace('\'', "'\\''");
            list.push_str(&format!("file '{}'\n", escaped));
        }
        std::fs::write(&list_path, list)
            .with_context(|| format!("Failed to write {}", list_path.display()))?;

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
            "-c:a".into(),
            "aac".into(),
            "-ac".into(),
            "2".into(),
            "-b:a".into(),
            self.settings.merge_audio_bitrate.clone(),
            "-vsync".into(),
            "cfr".into(),
            "-r".into(),
            self.settings.merge_fps.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ];
        args.extend(self.video_codec_args(encoder, "medium", Some(self.settings.merge_crf))?);
        args.push(output.display().to_string());

        debug!(clips = inputs.len(), output = %output.display(), ?encoder, "Concatenating clips");
        let result = self.run(&self.settings.ffmpeg_path, &args);
        let _ = std::fs::remove_file(&list_path);
        result?;

        if !output.exists() {
            bail!("ffmpeg reported success but {} is missing", output.display());
        }
        Ok(())
    }

    fn supports_hardware(&self) -> bool {
        self.settings.hardware_encoder.is_some()
    }
}

/// Seconds with millisecond precision, as ffmpeg expects them.
fn format_seconds(seconds: f64) -> String {
    format!("{:.3}", seconds.max(0.0))
}
