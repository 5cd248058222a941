//! Sentences command - list transcript sentences.

use super::expand_files;
use crate::app::App;
use crate::OutputFormat;
use phrasecut_core::Config;

/// Run the sentences command.
pub fn run(config: Config, patterns: &[String], output: OutputFormat) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let files = expand_files(patterns)?;

    let index = app.manager.index();
    let sentences = index.sentences(&files);

    match output {
        OutputFormat::Text => {
            for entry in &sentences {
                println!("{}: {}", entry.file.display(), entry.current);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&sentences)?);
        }
    }

    let missing = index.missing();
    eprintln!();
    eprintln!(
        "{} sentences from {} files",
        sentences.len(),
        index.stats().indexed
    );
    for path in &missing {
        eprintln!("  no transcript: {}", path.display());
    }

    Ok(())
}
