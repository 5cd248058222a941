//! # Phrasecut CLI
//!
//! Command-line interface for finding phrases and pauses in transcribed
//! video and cutting them into clips.
//!
//! ## Commands
//!
//! - `phrasecut search <query> --files ...` - Find phrases and render clips
//! - `phrasecut silences --files ... --min <s> --max <s>` - Find pauses
//! - `phrasecut render <source> --start <s> --end <s>` - Cut one clip
//! - `phrasecut merge <timeline.json>` - Render and join a timeline
//! - `phrasecut sentences --files ...` - List transcript sentences
//!
//! ## Example Usage
//!
//! ```bash
//! # Two phrases across every talk, partial matches allowed
//! phrasecut search "thank you; see you next time" --files "talks/*.mp4" --partial
//!
//! # Pauses between one and two seconds, as JSON lines
//! phrasecut silences --files talk.mp4 --min 1 --max 2 --output json
//! ```

mod app;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Phrasecut - Find spoken phrases in video and cut them into clips
#[derive(Parser)]
#[command(name = "phrasecut")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search transcripts for phrases (separate phrases with ';')
    Search(commands::search::SearchArgs),

    /// Find pauses between words
    Silences {
        /// Video files or glob patterns
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<String>,

        /// Shortest pause, seconds
        #[arg(long)]
        min: f64,

        /// Longest pause, seconds
        #[arg(long)]
        max: f64,

        /// Maximum number of pauses to report
        #[arg(long)]
        max_results: Option<usize>,

        /// Report pauses without rendering clips
        #[arg(long)]
        no_render: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Cut a single clip from a source video
    Render {
        /// Source video
        source: PathBuf,

        /// Segment start, seconds
        #[arg(long)]
        start: f64,

        /// Segment end, seconds
        #[arg(long)]
        end: f64,

        /// Milliseconds to cut from the start (negative extends)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        start_trim_ms: i64,

        /// Milliseconds to cut from the end (negative extends)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        end_trim_ms: i64,

        /// Playback speed between 0.5 and 1.0
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Output file (default: derived name in the output directory)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Render and join the entries of a timeline file
    Merge {
        /// JSON list of timeline entries, or a merge request object
        timeline: PathBuf,

        /// Directory for the merged file
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// List transcript sentences with their neighbours
    Sentences {
        /// Video files or glob patterns
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => phrasecut_core::Config::load_from(path)?,
        None => phrasecut_core::Config::load()?,
    };

    // Setup logging; stdout carries the event stream
    let log_level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.general.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    // Execute command
    match cli.command {
        Commands::Search(args) => commands::search::run(config, args),
        Commands::Silences {
            files,
            min,
            max,
            max_results,
            no_render,
            output,
        } => commands::silences::run(config, &files, min, max, max_results, no_render, output),
        Commands::Render {
            source,
            start,
            end,
            start_trim_ms,
            end_trim_ms,
            speed,
            out,
            output,
        } => commands::render::run(
            config,
            source,
            (start, end),
            (start_trim_ms, end_trim_ms),
            speed,
            out,
            output,
        ),
        Commands::Merge {
            timeline,
            out_dir,
            output,
        } => commands::merge::run(config, &timeline, out_dir, output),
        Commands::Sentences { files, output } => commands::sentences::run(config, &files, output),
    }
}
