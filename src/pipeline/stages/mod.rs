pub mod categorical_embed;
pub mod frequency;
pub mod imputation;
pub mod index;
pub mod partition;
pub mod statistical_embed;
pub mod statistics;
pub mod threshold;

pub use categorical_embed::CategoricalEmbedStage;
pub use frequency::FrequencyStage;
pub use imputation::ImputationStage;
pub use index::IndexStage;
pub use partition::PartitionStage;
pub use statistical_embed::StatisticalEmbedStage;
pub use statistics::StatisticsStage;
pub use threshold::ThresholdStage;

use super::PipelineStage;

/// The eight stages in execution order
pub fn default_stages() -> Vec<Box<dyn PipelineStage>> {
    vec![
        Box::new(ImputationStage),
        Box::new(StatisticsStage),
        Box::new(FrequencyStage),
        Box::new(PartitionStage),
        Box::new(CategoricalEmbedStage),
        Box::new(StatisticalEmbedStage),
        Box::new(ThresholdStage),
        Box::new(IndexStage),
    ]
}
