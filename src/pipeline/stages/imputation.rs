use crate::constants::{MISSING_CATEGORICAL, MISSING_CONTINUOUS};
use crate::error::Result;
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

/// Stage 1: replace absent or null fields with sentinels in one bulk update.
///
/// Mutates the source collection in place. Running it again over imputed
/// data writes nothing.
pub struct ImputationStage;

impl ImputationStage {
    pub fn defaults(ctx: &StageContext) -> Vec<(String, Value)> {
        let continuous = ctx
            .variables
            .continuous()
            .iter()
            .map(|v| (v.name.clone(), Value::from(MISSING_CONTINUOUS)));
        let categorical = ctx
            .variables
            .categorical()
            .iter()
            .map(|v| (v.name.clone(), Value::from(MISSING_CATEGORICAL)));
        continuous.chain(categorical).collect()
    }
}

#[async_trait]
impl PipelineStage for ImputationStage {
    fn stage_number(&self) -> u8 {
        1
    }

    fn stage_name(&self) -> &'static str {
        "imputation"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.source))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let source = &ctx.collections.source;
        let defaults = Self::defaults(ctx);
        let written = ctx.store.set_if_absent(source, &defaults).await?;
        let records = ctx.store.count(source).await?;

        info!("🩹 Imputed {} missing fields across {} records", written, records);
        Ok(StageResult::new(
            records as usize,
            written as usize,
            format!("filled {written} missing fields"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::context_with;
    use serde_json::json;

    #[tokio::test]
    async fn test_every_field_present_after_imputation() {
        let ctx = context_with(vec![
            json!({"age": 70, "test_time": 5.6, "sex": 0}),
            json!({"age": null, "sex": 1}),
            json!({}),
        ])
        .await;

        let result = ImputationStage.execute(&ctx).await.unwrap();
        assert_eq!(result.processed_count, 3);
        assert_eq!(result.written_count, 5);

        let docs = ctx.store.find_all(&ctx.collections.source).await.unwrap();
        for doc in &docs {
            assert!(doc["age"].is_number());
            assert!(doc["test_time"].is_number());
            assert!(doc["sex"].is_string() || doc["sex"].is_number());
        }
        assert_eq!(docs[1]["age"], json!(-1));
        assert_eq!(docs[1]["test_time"], json!(-1));
        assert_eq!(docs[2]["sex"], json!("empty"));
        assert_eq!(docs[0]["age"], json!(70));
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let ctx = context_with(vec![json!({"age": null})]).await;
        ImputationStage.execute(&ctx).await.unwrap();
        let again = ImputationStage.execute(&ctx).await.unwrap();
        assert_eq!(again.written_count, 0);
    }
}
