use crate::constants::stats_field;
use crate::domain::{Document, EmbeddedStats};
use crate::error::Result;
use crate::pipeline::{require_statistic, PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

/// Stage 6: copy every source record with `<variable>_stats` attached for
/// each continuous variable.
pub struct StatisticalEmbedStage;

impl StatisticalEmbedStage {
    const NAME: &'static str = "statistical_embed";
}

#[async_trait]
impl PipelineStage for StatisticalEmbedStage {
    fn stage_number(&self) -> u8 {
        6
    }

    fn stage_name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.statistical_embed))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let stats = ctx.load_statistics().await?;
        let mut attachments: Vec<(String, Value)> =
            Vec::with_capacity(ctx.variables.continuous().len());
        for variable in ctx.variables.continuous() {
            let stat = require_statistic(&stats, Self::NAME, &variable.name)?;
            let embedded = serde_json::to_value(EmbeddedStats::from(stat))?;
            attachments.push((stats_field(&variable.name), embedded));
        }

        let docs = ctx.store.find_all(&ctx.collections.source).await?;
        let processed = docs.len();
        let embedded: Vec<Document> = docs
            .into_iter()
            .map(|mut doc| {
                for (field, stats) in &attachments {
                    doc.insert(field.clone(), stats.clone());
                }
                doc
            })
            .collect();

        let written = ctx
            .write_batched(&ctx.collections.statistical_embed, embedded)
            .await?;

        info!(
            "📎 Embedded continuous statistics into {} documents ({})",
            written, ctx.collections.statistical_embed
        );
        Ok(StageResult::new(
            processed,
            written,
            format!("{written} documents with embedded statistics"),
        ))
    }
}
