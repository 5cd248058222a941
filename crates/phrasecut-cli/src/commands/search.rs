//! Search command - find phrases and render clips.

use super::{drain, expand_files, summary_line};
use crate::app::App;
use crate::OutputFormat;
use clap::Args;
use phrasecut_core::{Config, SearchOptions, SearchRequest};
use std::time::Instant;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Phrases to find, separated by ';'
    pub query: String,

    /// Video files or glob patterns
    #[arg(short, long, num_args = 1.., required = true)]
    pub files: Vec<String>,

    /// Shortest pause required after short matches, seconds
    #[arg(long)]
    pub min_silence: Option<f64>,

    /// Longest pause allowed after short matches, seconds
    #[arg(long)]
    pub max_silence: Option<f64>,

    /// Matches with at most this many words must pass the pause check
    #[arg(long)]
    pub threshold: Option<usize>,

    /// Maximum number of matches per phrase
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Fall back to shorter runs of words when a phrase has no match
    #[arg(long)]
    pub partial: bool,

    /// Like --partial, down to single words
    #[arg(long)]
    pub all_partial: bool,

    /// Report matches without rendering clips
    #[arg(long)]
    pub no_render: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub output: OutputFormat,
}

impl SearchArgs {
    /// Request options: config defaults overridden by flags.
    pub fn options(&self, config: &Config) -> SearchOptions {
        let mut options = SearchOptions::from_config(config);
        if let Some(min) = self.min_silence {
            options.min_silence = min;
        }
        if let Some(max) = self.max_silence {
            options.max_silence = max;
        }
        if let Some(threshold) = self.threshold {
            options.word_count_threshold = threshold;
        }
        if let Some(max_results) = self.max_results {
            options.max_results_per_segment = max_results;
        }
        options.allow_partial = self.partial;
        options.allow_all_partial = self.all_partial;
        options.render_clips = !self.no_render;
        options
    }
}

/// Run the search command.
pub fn run(config: Config, args: SearchArgs) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let files = expand_files(&args.files)?;
    let options = args.options(&app.config);

    let start = Instant::now();
    let stream = app
        .manager
        .start_search(SearchRequest::new(files, args.query.clone()).with_options(options))?;
    let summary = drain(stream, args.output)?;

    eprintln!();
    eprintln!(
        "{} in {:.2}s",
        summary_line(&summary),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: SearchArgs,
    }

    #[test]
    fn test_flags_override_config() {
        let harness = Harness::parse_from([
            "search",
            "hello world",
            "--files",
            "a.mp4",
            "b.mp4",
            "--max-results",
            "5",
            "--partial",
            "--no-render",
        ]);
        let mut config = Config::default();
        config.search.silence_word_threshold = 4;

        let options = harness.args.options(&config);
        assert_eq!(harness.args.files, vec!["a.mp4", "b.mp4"]);
        assert_eq!(options.max_results_per_segment, 5);
        assert_eq!(options.word_count_threshold, 4);
        assert!(options.allow_partial);
        assert!(!options.allow_all_partial);
        assert!(!options.render_clips);
    }
}
