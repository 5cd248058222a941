//! Render command - cut a single clip.

use crate::app::App;
use crate::OutputFormat;
use phrasecut_core::{Config, RenderJob};
use std::path::PathBuf;
use std::time::Instant;

/// Run the render command.
pub fn run(
    config: Config,
    source: PathBuf,
    (start, end): (f64, f64),
    (start_trim_ms, end_trim_ms): (i64, i64),
    speed: f64,
    out: Option<PathBuf>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;

    let mut job = RenderJob::new(source, start, end)
        .with_trim(start_trim_ms, end_trim_ms)
        .with_speed(speed);
    if let Some(path) = out {
        job = job.with_output(path);
    }

    let timer = Instant::now();
    let clip = app.manager.render(&job)?;

    match output {
        OutputFormat::Text => {
            println!("{}", clip.clip_path.display());
            eprintln!(
                "Rendered {:.2}s ({:.2}-{:.2} at {}x, {:?}) in {:.2}s",
                clip.duration(),
                clip.start,
                clip.end,
                clip.speed,
                clip.encoder,
                timer.elapsed().as_secs_f64()
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&clip)?);
        }
    }

    Ok(())
}
