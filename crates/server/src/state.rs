use std::sync::Arc;

use nemorosa_core::pipeline::JobRegistry;
use nemorosa_core::{Config, Orchestrator};

/// Shared application state.
pub struct AppState {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<JobRegistry>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>, jobs: Arc<JobRegistry>) -> Self {
        Self {
            config,
            orchestrator,
            jobs,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.config.server.api_key.as_deref()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }
}
