use crate::constants::{frequencies_field, ID_FIELD};
use crate::domain::Document;
use crate::error::Result;
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument};

/// Stage 5: copy every source record with each categorical variable's whole
/// frequency table attached as `<variable>_frequencies`.
///
/// Tables are fetched once per run. A variable without a table is not attached.
pub struct CategoricalEmbedStage;

#[async_trait]
impl PipelineStage for CategoricalEmbedStage {
    fn stage_number(&self) -> u8 {
        5
    }

    fn stage_name(&self) -> &'static str {
        "categorical_embed"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.categorical_embed))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let mut tables: Vec<(String, Value)> = Vec::new();
        for variable in ctx.variables.categorical() {
            match ctx
                .store
                .find_by_id(&ctx.collections.frequencies, &variable.name)
                .await?
            {
                Some(mut table) => {
                    table.remove(ID_FIELD);
                    tables.push((frequencies_field(&variable.name), Value::Object(table)));
                }
                None => debug!(variable = %variable.name, "No frequency table to embed"),
            }
        }

        let docs = ctx.store.find_all(&ctx.collections.source).await?;
        let processed = docs.len();
        let embedded: Vec<Document> = docs
            .into_iter()
            .map(|mut doc| {
                for (field, table) in &tables {
                    doc.insert(field.clone(), table.clone());
                }
                doc
            })
            .collect();

        let written = ctx
            .write_batched(&ctx.collections.categorical_embed, embedded)
            .await?;

        info!(
            "🧩 Embedded categorical frequencies into {} documents ({})",
            written, ctx.collections.categorical_embed
        );
        Ok(StageResult::new(
            processed,
            written,
            format!("{written} documents with embedded frequencies"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::context_with;
    use crate::pipeline::stages::FrequencyStage;
    use serde_json::json;

    #[tokio::test]
    async fn test_one_copy_per_source_record_with_live_table() {
        let ctx = context_with(vec![
            json!({"_id": "r1", "age": 50, "sex": 0}),
            json!({"_id": "r2", "age": 60, "sex": 1}),
            json!({"_id": "r3", "age": 70, "sex": 1}),
        ])
        .await;
        FrequencyStage.execute(&ctx).await.unwrap();
        let result = CategoricalEmbedStage.execute(&ctx).await.unwrap();
        assert_eq!(result.written_count, 3);

        let docs = ctx
            .store
            .find_all(&ctx.collections.categorical_embed)
            .await
            .unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["_id"], json!("r1"));
        assert_eq!(docs[2]["age"], json!(70));
        for doc in &docs {
            assert_eq!(doc["sex_frequencies"], json!({"sex": {"0": 1, "1": 2}}));
        }
    }

    #[tokio::test]
    async fn test_missing_table_is_not_attached() {
        let ctx = context_with(vec![json!({"age": 1})]).await;
        CategoricalEmbedStage.execute(&ctx).await.unwrap();
        let docs = ctx
            .store
            .find_all(&ctx.collections.categorical_embed)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].contains_key("sex_frequencies"));
    }
}
