//! Fakes shared by unit tests.

use crate::render::{EncoderKind, TranscodeSpec, Transcoder};
use anyhow::bail;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Scripted [`Transcoder`] that writes placeholder files instead of
/// spawning ffmpeg.
#[derive(Default)]
pub struct FakeTranscoder {
    hardware: bool,
    fail_hardware: bool,
    fail_software: bool,
    fail_inputs: Vec<PathBuf>,
    panic: bool,
    duration: Option<f64>,
    delay: Option<Duration>,

    calls: Mutex<Vec<TranscodeSpec>>,
    concats: Mutex<Vec<(Vec<PathBuf>, PathBuf, EncoderKind)>>,

    held: Mutex<bool>,
    released: Condvar,

    hardware_active: AtomicUsize,
    hardware_peak: AtomicUsize,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    pub fn fail_hardware(mut self) -> Self {
        self.fail_hardware = true;
        self
    }

    pub fn fail_software(mut self) -> Self {
        self.fail_software = true;
        self
    }

    /// Fail every transcode reading `input`
    pub fn fail_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.fail_inputs.push(input.into());
        self
    }

    /// Panic inside every transcode
    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make transcodes block until [`FakeTranscoder::release`]
    pub fn held(self) -> Self {
        *self.held.lock() = true;
        self
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    pub fn calls(&self) -> Vec<TranscodeSpec> {
        self.calls.lock().clone()
    }

    pub fn concats(&self) -> Vec<(Vec<PathBuf>, PathBuf, EncoderKind)> {
        self.concats.lock().clone()
    }

    pub fn peak_hardware(&self) -> usize {
        self.hardware_peak.load(Ordering::Acquire)
    }

    /// Wait until at least `n` transcodes have started.
    pub fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.calls.lock().len() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

impl Transcoder for FakeTranscoder {
    fn transcode(&self, spec: &TranscodeSpec) -> anyhow::Result<()> {
        self.calls.lock().push(spec.clone());
        if self.panic {
            panic!("scripted transcoder panic");
        }

        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }

        let hardware = spec.encoder == EncoderKind::Hardware;
        if hardware {
            let now = self.hardware_active.fetch_add(1, Ordering::AcqRel) + 1;
            self.hardware_peak.fetch_max(now, Ordering::AcqRel);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if hardware {
            self.hardware_active.fetch_sub(1, Ordering::AcqRel);
        }

        if self.fail_inputs.iter().any(|p| p == &spec.input) {
            bail!("scripted failure for {}", spec.input.display());
        }
        match spec.encoder {
            EncoderKind::Hardware if self.fail_hardware => bail!("scripted hardware failure"),
            EncoderKind::Software if self.fail_software => bail!("scripted software failure"),
            _ => {}
        }

        std::fs::write(&spec.output, format!("{:?}", spec))?;
        Ok(())
    }

    fn probe_duration(&self, _path: &Path) -> anyhow::Result<f64> {
        Ok(self.duration.unwrap_or(3600.0))
    }

    fn concat(&self, inputs: &[PathBuf], output: &Path, encoder: EncoderKind) -> anyhow::Result<()> {
        self.concats
            .lock()
            .push((inputs.to_vec(), output.to_path_buf(), encoder));
        match encoder {
            EncoderKind::Hardware if self.fail_hardware => bail!("scripted hardware failure"),
            EncoderKind::Software if self.fail_software => bail!("scripted software failure"),
            _ => {}
        }
        std::fs::write(output, b"merged")?;
        Ok(())
    }

    fn supports_hardware(&self) -> bool {
        self.hardware
    }
}
