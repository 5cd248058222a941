//! Silences command - find pauses between words.

use super::{drain, expand_files, summary_line};
use crate::app::App;
use crate::OutputFormat;
use phrasecut_core::{Config, SilenceSearchRequest};
use std::time::Instant;

/// Run the silences command.
pub fn run(
    config: Config,
    patterns: &[String],
    min: f64,
    max: f64,
    max_results: Option<usize>,
    no_render: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let files = expand_files(patterns)?;

    let mut request = SilenceSearchRequest::new(files, min, max);
    request.max_results_per_segment =
        max_results.unwrap_or(app.config.search.max_results_per_segment);
    request.render_clips = !no_render;

    let start = Instant::now();
    let stream = app.manager.start_silence_search(request)?;
    let summary = drain(stream, output)?;

    eprintln!();
    eprintln!(
        "{} in {:.2}s",
        summary_line(&summary),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}
