use crate::domain::category_key;
use crate::error::Result;
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Stage 3: occurrence counts per category value for each categorical variable.
///
/// One scan tallies counts in memory; each `(variable, category)` pair is then
/// upserted with a single increment. Null or absent values are skipped, and a
/// variable with no values never gets a table.
pub struct FrequencyStage;

#[async_trait]
impl PipelineStage for FrequencyStage {
    fn stage_number(&self) -> u8 {
        3
    }

    fn stage_name(&self) -> &'static str {
        "frequency"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.frequencies))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let docs = ctx.store.find_all(&ctx.collections.source).await?;

        let mut tallies: Vec<BTreeMap<String, i64>> =
            vec![BTreeMap::new(); ctx.variables.categorical().len()];
        for doc in &docs {
            for (variable, tally) in ctx.variables.categorical().iter().zip(tallies.iter_mut()) {
                if let Some(key) = doc.get(&variable.name).and_then(category_key) {
                    *tally.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut upserts = 0;
        for (variable, tally) in ctx.variables.categorical().iter().zip(&tallies) {
            for (category, count) in tally {
                ctx.store
                    .increment(
                        &ctx.collections.frequencies,
                        &variable.name,
                        &[variable.name.as_str(), category.as_str()],
                        *count,
                    )
                    .await?;
                upserts += 1;
            }
            debug!(variable = %variable.name, categories = tally.len(), "Counted frequencies");
        }

        info!("🔢 Frequency counts calculated over {} records", docs.len());
        Ok(StageResult::new(
            docs.len(),
            upserts,
            format!("{upserts} category counters"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::context_with;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_sum_to_non_null_records() {
        let ctx = context_with(vec![
            json!({"sex": 0}),
            json!({"sex": 1}),
            json!({"sex": 0}),
            json!({"sex": null}),
            json!({"sex": "empty"}),
            json!({}),
        ])
        .await;

        let result = FrequencyStage.execute(&ctx).await.unwrap();
        assert_eq!(result.processed_count, 6);

        let table = ctx
            .store
            .find_by_id(&ctx.collections.frequencies, "sex")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table["sex"], json!({"0": 2, "1": 1, "empty": 1}));

        let total: i64 = table["sex"]
            .as_object()
            .unwrap()
            .values()
            .map(|v| v.as_i64().unwrap())
            .sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_no_table_without_values() {
        let ctx = context_with(vec![json!({"age": 3})]).await;
        FrequencyStage.execute(&ctx).await.unwrap();
        assert_eq!(ctx.store.count(&ctx.collections.frequencies).await.unwrap(), 0);
    }
}
