//! Application state management.

use phrasecut_core::{Config, SessionManager};
use tracing::info;

/// Shared application state.
pub struct App {
    /// Configuration
    pub config: Config,

    /// Runs searches, renders and merges
    pub manager: SessionManager,
}

impl App {
    /// Create a new application instance.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let manager = SessionManager::from_config(&config)?;

        info!(
            output_dir = %manager.settings().output_dir.display(),
            workers = manager.settings().workers,
            hardware = config.render.hardware_encoder.as_deref().unwrap_or("none"),
            "Application initialized"
        );

        Ok(App { config, manager })
    }
}
