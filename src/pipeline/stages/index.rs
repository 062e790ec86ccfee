use crate::error::Result;
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use tracing::{info, instrument};

/// Stage 8: compound index on the source collection (`age` desc, `sex` asc by default)
pub struct IndexStage;

#[async_trait]
impl PipelineStage for IndexStage {
    fn stage_number(&self) -> u8 {
        8
    }

    fn stage_name(&self) -> &'static str {
        "index"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.source, index = %ctx.index.name))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        ctx.store
            .create_index(&ctx.collections.source, &ctx.index)
            .await?;
        info!("🗂️ Compound index {} created on {}", ctx.index.name, ctx.collections.source);
        Ok(StageResult::new(0, 1, format!("index {}", ctx.index.name)))
    }
}
