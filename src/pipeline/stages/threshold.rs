use crate::constants::{stats_field, FLAG_FIELD, FLAG_VALUE_FIELD};
use crate::domain::{ContinuousVariable, Document, EmbeddedStats, ThresholdFlagMode};
use crate::error::{EtlError, Result};
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use crate::storage::document_id;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

/// Stage 7: flag records whose attached stats have `standardDeviation > factor * average`.
///
/// In `LastVariable` mode the single `ExcedingValue.value` flag holds the
/// result for the last continuous variable only, earlier results being
/// overwritten, and an undefined standard deviation or average compares as 0.
/// `PerVariable` mode keeps one flag per variable and an undefined side tests
/// false.
///
/// Flags are written `batch_size` records at a time.
pub struct ThresholdStage;

impl ThresholdStage {
    /// Threshold result for one variable; records without attached stats test false
    pub fn exceeds(
        doc: &Document,
        variable: &ContinuousVariable,
        factor: f64,
        mode: ThresholdFlagMode,
    ) -> bool {
        doc.get(&stats_field(&variable.name))
            .and_then(|v| serde_json::from_value::<EmbeddedStats>(v.clone()).ok())
            .map(|stats| match mode {
                ThresholdFlagMode::LastVariable => stats.exceeds_null_as_zero(factor),
                ThresholdFlagMode::PerVariable => stats.exceeds(factor),
            })
            .unwrap_or(false)
    }

    pub fn flag_value(
        doc: &Document,
        variables: &[ContinuousVariable],
        factor: f64,
        mode: ThresholdFlagMode,
    ) -> Value {
        let mut flags = Map::new();
        match mode {
            ThresholdFlagMode::LastVariable => {
                for variable in variables {
                    flags.insert(
                        FLAG_VALUE_FIELD.to_string(),
                        Value::Bool(Self::exceeds(doc, variable, factor, mode)),
                    );
                }
            }
            ThresholdFlagMode::PerVariable => {
                for variable in variables {
                    flags.insert(
                        variable.name.clone(),
                        Value::Bool(Self::exceeds(doc, variable, factor, mode)),
                    );
                }
            }
        }
        Value::Object(flags)
    }
}

#[async_trait]
impl PipelineStage for ThresholdStage {
    fn stage_number(&self) -> u8 {
        7
    }

    fn stage_name(&self) -> &'static str {
        "threshold"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.statistical_embed, mode = ?ctx.flag_mode))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let collection = &ctx.collections.statistical_embed;
        let docs = ctx.store.find_all(collection).await?;

        let mut flagged = 0usize;
        let mut updates = Vec::with_capacity(docs.len());
        for doc in &docs {
            let id = document_id(doc).ok_or_else(|| {
                EtlError::InvalidUpdate(format!("document without _id in {collection}"))
            })?;
            let flags = Self::flag_value(
                doc,
                ctx.variables.continuous(),
                ctx.threshold_factor,
                ctx.flag_mode,
            );
            if flags
                .as_object()
                .map(|m| m.values().any(|v| v == &Value::Bool(true)))
                .unwrap_or(false)
            {
                flagged += 1;
            }
            updates.push((id, flags));
        }

        let mut matched = 0u64;
        let mut updates = updates.into_iter().peekable();
        while updates.peek().is_some() {
            let batch: Vec<_> = updates.by_ref().take(ctx.batch_size.max(1)).collect();
            matched += ctx.store.set_field_many(collection, FLAG_FIELD, batch).await?;
            debug!("Flagged {} documents in {}", matched, collection);
        }
        if matched < docs.len() as u64 {
            warn!(
                "{} documents disappeared before they could be flagged",
                docs.len() as u64 - matched
            );
        }

        info!(
            "🚩 Threshold flags written for {} documents ({} flagged)",
            docs.len(),
            flagged
        );
        Ok(StageResult::new(
            docs.len(),
            matched as usize,
            format!("{flagged} of {} documents exceed the threshold", docs.len()),
        ))
    }
}
