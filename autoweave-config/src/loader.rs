//! Layered config loading: defaults, optional file, environment.

use std::path::Path;

use config::{Environment, File, FileFormat};
use thiserror::Error;
use tracing::info;

use crate::models::Config;
use crate::validation::{self, ConfigGuardRailError, ConfigWarning};

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}

/// Loads and validates daemon configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Builds the effective config from an optional TOML file plus
    /// `AUTOWEAVE__SECTION__KEY` environment overrides, then applies the
    /// guard rails. Warnings are returned for the caller to log.
    pub fn load(
        file: Option<&Path>,
    ) -> Result<(Config, Vec<ConfigWarning>), ConfigLoadError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            info!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(
                File::from(path).format(FileFormat::Toml).required(true),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("AUTOWEAVE")
                .prefix_separator("__")
                .separator("__"),
        );

        let raw = builder.build()?;
        let config: Config = raw.try_deserialize()?;
        let warnings = validation::validate(&config)?;
        Ok((config, warnings))
    }
}
