//! The batch job: eight stages run in strict order over shared collections.

pub mod orchestrator;
pub mod report;
pub mod stages;

pub use orchestrator::BatchTransformer;
pub use report::{fingerprint, CollectionFingerprint, RunReport, StageRecord};

use crate::config::{CollectionsConfig, Config};
use crate::domain::{Document, IndexSpec, ThresholdFlagMode, VariableSet, VariableStatistic};
use crate::error::{EtlError, Result};
use crate::storage::DocumentStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a stage needs: the store, collection names and the ordered variables
pub struct StageContext {
    pub store: Arc<dyn DocumentStore>,
    pub collections: CollectionsConfig,
    pub variables: VariableSet,
    pub threshold_factor: f64,
    pub flag_mode: ThresholdFlagMode,
    pub batch_size: usize,
    pub index: IndexSpec,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("store", &self.store.engine())
            .field("collections", &self.collections)
            .field("variables", &self.variables)
            .field("threshold_factor", &self.threshold_factor)
            .field("flag_mode", &self.flag_mode)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl StageContext {
    pub fn from_config(config: &Config, store: Arc<dyn DocumentStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            collections: config.collections.clone(),
            variables: config.variable_set()?,
            threshold_factor: config.pipeline.threshold_factor,
            flag_mode: config.pipeline.flag_mode,
            batch_size: config.pipeline.batch_size,
            index: config.index_spec()?,
        })
    }

    /// Load every Variable Statistic once, keyed by variable name
    pub async fn load_statistics(&self) -> Result<HashMap<String, VariableStatistic>> {
        let docs = self.store.find_all(&self.collections.statistics).await?;
        docs.iter()
            .map(|doc| VariableStatistic::from_document(doc).map(|s| (s.variable.clone(), s)))
            .collect()
    }

    /// Insert `docs` in chunks of `batch_size`
    pub async fn write_batched(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        let mut written = 0;
        let mut batch = Vec::with_capacity(self.batch_size.min(docs.len()));
        for doc in docs {
            batch.push(doc);
            if batch.len() >= self.batch_size {
                written += self
                    .store
                    .insert_many(collection, std::mem::take(&mut batch))
                    .await?;
                debug!("Wrote {} documents to {}", written, collection);
            }
        }
        if !batch.is_empty() {
            written += self.store.insert_many(collection, batch).await?;
        }
        Ok(written)
    }
}

/// Look up a variable's statistic, failing the stage when it was never computed
pub(crate) fn require_statistic<'a>(
    stats: &'a HashMap<String, VariableStatistic>,
    stage: &'static str,
    variable: &str,
) -> Result<&'a VariableStatistic> {
    stats.get(variable).ok_or_else(|| EtlError::MissingDependency {
        stage,
        what: format!("statistic for variable '{variable}'"),
    })
}

/// Common trait for all pipeline stages
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Position in the run, 1 through 8
    fn stage_number(&self) -> u8;

    fn stage_name(&self) -> &'static str;

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult>;
}

/// Result of executing a pipeline stage
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    /// Documents read or examined
    pub processed_count: usize,
    /// Documents or fields written
    pub written_count: usize,
    pub message: String,
}

impl StageResult {
    pub fn new(processed: usize, written: usize, message: impl Into<String>) -> Self {
        Self {
            processed_count: processed,
            written_count: written,
            message: message.into(),
        }
    }
}
