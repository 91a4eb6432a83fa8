pub mod commands;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

use crate::config::RomToolConfig;
use crate::services::{CatalogueService, InstallPipeline};

/// Services shared by every command.
#[derive(Clone)]
pub struct AppState {
    pub config: RomToolConfig,
    pub catalogue: CatalogueService,
    pub pipeline: InstallPipeline,
}

impl AppState {
    pub fn new(config: RomToolConfig) -> Self {
        let catalogue = CatalogueService::from_config(&config);
        let pipeline = InstallPipeline::new(&config);
        Self {
            config,
            catalogue,
            pipeline,
        }
    }
}
