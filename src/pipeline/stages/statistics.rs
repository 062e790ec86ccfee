use crate::domain::VariableStatistic;
use crate::error::Result;
use crate::pipeline::{PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

/// Stage 2: mean, sample standard deviation and count per continuous variable.
///
/// Aggregation is delegated to the store. Imputed `-1` sentinels take part
/// in the averages like any other value.
pub struct StatisticsStage;

#[async_trait]
impl PipelineStage for StatisticsStage {
    fn stage_number(&self) -> u8 {
        2
    }

    fn stage_name(&self) -> &'static str {
        "statistics"
    }

    #[instrument(skip_all, fields(collection = %ctx.collections.statistics))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let mut docs = Vec::with_capacity(ctx.variables.continuous().len());
        for variable in ctx.variables.continuous() {
            let aggregate = ctx
                .store
                .aggregate_field(&ctx.collections.source, &variable.name)
                .await?;
            let stat = VariableStatistic::from_aggregate(variable, aggregate);
            debug!(
                variable = %stat.variable,
                ordinal = stat.ordinal,
                mean = ?stat.mean,
                stddev = ?stat.stddev,
                count = stat.count,
                "Aggregated variable"
            );
            docs.push(stat.to_document()?);
        }

        let n = docs.len();
        ctx.store
            .insert_many(&ctx.collections.statistics, docs)
            .await?;

        info!("📊 Statistics calculated for {} continuous variables", n);
        Ok(StageResult::new(n, n, format!("{n} variable statistics")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::context_with;
    use serde_json::json;

    #[tokio::test]
    async fn test_known_fixture() {
        let ctx = context_with(vec![
            json!({"age": 10, "test_time": 1.0}),
            json!({"age": 20, "test_time": 1.0}),
            json!({"age": 30, "test_time": 4.0}),
        ])
        .await;

        StatisticsStage.execute(&ctx).await.unwrap();
        let stats = ctx.load_statistics().await.unwrap();

        let age = &stats["age"];
        assert_eq!(age.ordinal, 1);
        assert_eq!(age.mean, Some(20.0));
        assert!((age.stddev.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(age.count, 3);

        let time = &stats["test_time"];
        assert_eq!(time.ordinal, 2);
        assert_eq!(time.mean, Some(2.0));
        assert!((time.stddev.unwrap() - 3.0_f64.sqrt()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sentinels_bias_the_mean() {
        let ctx = context_with(vec![json!({"age": 41}), json!({"age": -1})]).await;
        StatisticsStage.execute(&ctx).await.unwrap();
        let stats = ctx.load_statistics().await.unwrap();
        assert_eq!(stats["age"].mean, Some(20.0));
    }

    #[tokio::test]
    async fn test_statistics_written_in_variable_order() {
        let ctx = context_with(vec![json!({"age": 1, "test_time": 2})]).await;
        StatisticsStage.execute(&ctx).await.unwrap();
        let docs = ctx
            .store
            .find_all(&ctx.collections.statistics)
            .await
            .unwrap();
        let names: Vec<_> = docs.iter().map(|d| d["variable"].clone()).collect();
        assert_eq!(names, vec![json!("age"), json!("test_time")]);
        // one value per variable: no sample stddev
        assert_eq!(docs[0]["stddev"], serde_json::Value::Null);
    }
}
