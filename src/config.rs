use crate::constants;
use crate::domain::{IndexKey, IndexSpec, SortOrder, ThresholdFlagMode, VariableSet};
use crate::error::{EtlError, Result};
use crate::storage::validate_collection_name;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub collections: CollectionsConfig,
    pub variables: VariablesConfig,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from(constants::DEFAULT_SQLITE_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionsConfig {
    pub source: String,
    pub statistics: String,
    pub frequencies: String,
    pub low_partition: String,
    pub high_partition: String,
    pub categorical_embed: String,
    pub statistical_embed: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            source: constants::SOURCE_COLLECTION.to_string(),
            statistics: constants::STATISTICS_COLLECTION.to_string(),
            frequencies: constants::FREQUENCY_COLLECTION.to_string(),
            low_partition: constants::LOW_PARTITION_COLLECTION.to_string(),
            high_partition: constants::HIGH_PARTITION_COLLECTION.to_string(),
            categorical_embed: constants::CATEGORICAL_EMBED_COLLECTION.to_string(),
            statistical_embed: constants::STATISTICAL_EMBED_COLLECTION.to_string(),
        }
    }
}

impl CollectionsConfig {
    /// Collections owned by the batch job, cleared at the start of every run
    pub fn derived(&self) -> [&str; 6] {
        [
            &self.statistics,
            &self.frequencies,
            &self.low_partition,
            &self.high_partition,
            &self.categorical_embed,
            &self.statistical_embed,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VariablesConfig {
    pub continuous: Vec<String>,
    pub categorical: Vec<String>,
}

impl Default for VariablesConfig {
    fn default() -> Self {
        Self {
            continuous: constants::CONTINUOUS_VARIABLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            categorical: constants::CATEGORICAL_VARIABLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexKeyConfig {
    pub field: String,
    /// 1 for ascending, -1 for descending
    pub direction: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub threshold_factor: f64,
    pub flag_mode: ThresholdFlagMode,
    pub batch_size: usize,
    pub index: Vec<IndexKeyConfig>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threshold_factor: constants::DEFAULT_THRESHOLD_FACTOR,
            flag_mode: ThresholdFlagMode::default(),
            batch_size: constants::DEFAULT_BATCH_SIZE,
            index: constants::INDEX_KEYS
                .iter()
                .map(|(field, direction)| IndexKeyConfig {
                    field: field.to_string(),
                    direction: *direction,
                })
                .collect(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                EtlError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            info!("⚙️ Loaded configuration from {}", path.display());
            toml::from_str::<Config>(&content)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `ETL_STORE_BACKEND` and `ETL_STORE_PATH` override the `[store]` table
    pub fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("ETL_STORE_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "memory" => self.store.backend = StoreBackend::Memory,
                "sqlite" => self.store.backend = StoreBackend::Sqlite,
                other => debug!("Ignoring unknown ETL_STORE_BACKEND value {:?}", other),
            }
        }
        if let Ok(path) = std::env::var("ETL_STORE_PATH") {
            if !path.trim().is_empty() {
                self.store.path = PathBuf::from(path.trim());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.pipeline.threshold_factor.is_finite() {
            return Err(EtlError::Config(
                "pipeline.threshold_factor must be a finite number".to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(EtlError::Config(
                "pipeline.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.index.is_empty() {
            return Err(EtlError::Config("pipeline.index needs at least one key".to_string()));
        }

        let mut seen = HashSet::new();
        let all = std::iter::once(self.collections.source.as_str())
            .chain(self.collections.derived());
        for name in all {
            validate_collection_name(name)?;
            if !seen.insert(name) {
                return Err(EtlError::Config(format!(
                    "collection '{name}' is configured for more than one role"
                )));
            }
        }

        self.variable_set()?;
        self.index_spec()?;
        Ok(())
    }

    pub fn variable_set(&self) -> Result<VariableSet> {
        if self.variables.continuous.is_empty() {
            return Err(EtlError::Config(
                "variables.continuous must list at least one variable".to_string(),
            ));
        }
        VariableSet::new(
            self.variables.continuous.iter().cloned(),
            self.variables.categorical.iter().cloned(),
        )
    }

    pub fn index_spec(&self) -> Result<IndexSpec> {
        let keys = self
            .pipeline
            .index
            .iter()
            .map(|k| {
                Ok(IndexKey {
                    field: k.field.clone(),
                    order: SortOrder::from_direction(k.direction)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexSpec::new(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.collections.source, "Samples");
        assert_eq!(config.variable_set().unwrap().continuous().len(), 21);
        assert_eq!(config.index_spec().unwrap().name, "age_-1_sex_1");
        assert_eq!(config.pipeline.flag_mode, ThresholdFlagMode::PerVariable);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[store]
backend = "memory"

[variables]
continuous = ["age", "test_time"]

[pipeline]
flag_mode = "last_variable"
batch_size = 50
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.variables.continuous, vec!["age", "test_time"]);
        assert_eq!(config.variables.categorical, vec!["sex"]);
        assert_eq!(config.pipeline.flag_mode, ThresholdFlagMode::LastVariable);
        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.pipeline.threshold_factor, 1.1);
        assert_eq!(config.collections.statistics, "statistics_ParkinsonsData");
    }

    #[test]
    fn test_rejects_shared_collection_names() {
        let mut config = Config::default();
        config.collections.low_partition = config.collections.high_partition.clone();
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_index_direction() {
        let mut config = Config::default();
        config.pipeline.index[0].direction = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
