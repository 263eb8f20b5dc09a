//! Layered configuration loading
//!
//! Sources are applied in order, later ones winning:
//!
//! 1. [`PipelineConfig::default`]
//! 2. An optional TOML file
//! 3. `UNITFLOW__<SECTION>__<KEY>` environment variables
//!
//! The merged result is validated before it is handed out.

use std::collections::HashMap;
use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use tracing::{debug, info};

use super::{ConfigResult, ConfigurationError, PipelineConfig};

const ENV_PREFIX: &str = "UNITFLOW";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from defaults, an optional file and the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<PipelineConfig> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::FileNotFound(path.display().to_string()));
            }
        }

        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let config = Self::finish(builder, None)?;

        info!(
            config_file = ?path.map(|p| p.display().to_string()),
            worker_count = config.execution.worker_count,
            max_cycles = config.execution.max_cycles,
            resource_slots = config.execution.resource_slots,
            "⚙️ Pipeline configuration loaded"
        );

        Ok(config)
    }

    /// Load from an in-memory TOML document layered over the defaults
    pub fn load_from_toml_str(contents: &str) -> ConfigResult<PipelineConfig> {
        let builder = Self::defaults()?.add_source(File::from_str(contents, FileFormat::Toml));
        Self::finish(builder, Some(HashMap::new()))
    }

    /// Environment overrides supplied explicitly instead of read from the process
    pub fn load_with_env(env: HashMap<String, String>) -> ConfigResult<PipelineConfig> {
        Self::finish(Self::defaults()?, Some(env))
    }

    fn defaults() -> ConfigResult<ConfigBuilder<DefaultState>> {
        Ok(Config::builder().add_source(Config::try_from(&PipelineConfig::default())?))
    }

    fn finish(
        builder: ConfigBuilder<DefaultState>,
        env: Option<HashMap<String, String>>,
    ) -> ConfigResult<PipelineConfig> {
        let builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(?config, "Validated pipeline configuration");
        Ok(config)
    }
}
