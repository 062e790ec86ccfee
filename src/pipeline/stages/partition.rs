use crate::domain::{numeric, BucketSide, PartitionBucket};
use crate::error::Result;
use crate::pipeline::{require_statistic, PipelineStage, StageContext, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Stage 4: split every continuous variable's values around its mean.
///
/// Values `<= mean` go to the low collection, the rest to the high one.
/// A present value that is not a number never compares `<=` the mean, so it
/// lands in the high bucket and every present value is placed exactly once.
pub struct PartitionStage;

impl PartitionStage {
    const NAME: &'static str = "partition";
}

#[async_trait]
impl PipelineStage for PartitionStage {
    fn stage_number(&self) -> u8 {
        4
    }

    fn stage_name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip_all, fields(low = %ctx.collections.low_partition, high = %ctx.collections.high_partition))]
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let stats = ctx.load_statistics().await?;

        let mut buckets = Vec::with_capacity(ctx.variables.continuous().len());
        for variable in ctx.variables.continuous() {
            let stat = require_statistic(&stats, Self::NAME, &variable.name)?;
            buckets.push((
                stat.mean,
                PartitionBucket::empty(&variable.name, stat.mean),
                PartitionBucket::empty(&variable.name, stat.mean),
            ));
        }

        let docs = ctx.store.find_all(&ctx.collections.source).await?;
        let mut non_numeric = 0usize;
        for doc in &docs {
            for (variable, (mean, low, high)) in
                ctx.variables.continuous().iter().zip(buckets.iter_mut())
            {
                let value = match doc.get(&variable.name) {
                    None | Some(Value::Null) => continue,
                    Some(value) => value,
                };
                let side = match (numeric(value), *mean) {
                    (Some(v), Some(m)) => BucketSide::classify(v, m),
                    (Some(_), None) => BucketSide::High,
                    (None, _) => {
                        non_numeric += 1;
                        BucketSide::High
                    }
                };
                match side {
                    BucketSide::Low => low.push(value.clone()),
                    BucketSide::High => high.push(value.clone()),
                }
            }
        }
        if non_numeric > 0 {
            warn!("{} non-numeric values placed in the high partition", non_numeric);
        }

        let mut low_docs = Vec::with_capacity(buckets.len());
        let mut high_docs = Vec::with_capacity(buckets.len());
        for (_, low, high) in &buckets {
            debug!(
                variable = %low.variable,
                low = low.count,
                high = high.count,
                "Partitioned variable"
            );
            low_docs.push(low.to_document()?);
            high_docs.push(high.to_document()?);
        }
        let written = ctx
            .store
            .insert_many(&ctx.collections.low_partition, low_docs)
            .await?
            + ctx
                .store
                .insert_many(&ctx.collections.high_partition, high_docs)
                .await?;

        info!("✂️ Documents divided into low/high partitions for {} variables", buckets.len());
        Ok(StageResult::new(
            docs.len(),
            written,
            format!("{written} partition buckets, {non_numeric} non-numeric values in high"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtlError;
    use crate::pipeline::stages::test_support::context_with;
    use crate::pipeline::stages::StatisticsStage;
    use serde_json::json;

    async fn buckets(ctx: &StageContext, collection: &str) -> Vec<PartitionBucket> {
        ctx.store
            .find_all(collection)
            .await
            .unwrap()
            .iter()
            .map(|d| PartitionBucket::from_document(d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_age_example() {
        let ctx = context_with(vec![json!({"age": 10}), json!({"age": 20}), json!({"age": 30})]).await;
        StatisticsStage.execute(&ctx).await.unwrap();
        PartitionStage.execute(&ctx).await.unwrap();

        let low = buckets(&ctx, &ctx.collections.low_partition).await;
        let high = buckets(&ctx, &ctx.collections.high_partition).await;
        assert_eq!(low[0].variable, "age");
        assert_eq!(low[0].values, vec![json!(10), json!(20)]);
        assert_eq!(low[0].count, 2);
        assert_eq!(low[0].mean_value, Some(20.0));
        assert_eq!(high[0].values, vec![json!(30)]);
        assert_eq!(high[0].count, 1);

        // test_time is absent everywhere: both buckets exist and are empty
        assert_eq!(low[1].variable, "test_time");
        assert_eq!(low[1].count, 0);
        assert_eq!(high[1].count, 0);
    }

    #[tokio::test]
    async fn test_partition_is_complete_and_exclusive() {
        let ctx = context_with(vec![
            json!({"age": 55, "test_time": 3.5}),
            json!({"age": 72, "test_time": 120.25}),
            json!({"age": 61}),
            json!({"age": 49, "test_time": 0.75}),
            json!({"age": 80, "test_time": null}),
        ])
        .await;
        StatisticsStage.execute(&ctx).await.unwrap();
        PartitionStage.execute(&ctx).await.unwrap();

        let low = buckets(&ctx, &ctx.collections.low_partition).await;
        let high = buckets(&ctx, &ctx.collections.high_partition).await;
        let stats = ctx.load_statistics().await.unwrap();

        for (l, h) in low.iter().zip(&high) {
            let mean = stats[&l.variable].mean.unwrap();
            assert!(l.values.iter().all(|v| v.as_f64().unwrap() <= mean));
            assert!(h.values.iter().all(|v| v.as_f64().unwrap() > mean));
            assert_eq!(l.count as usize, l.values.len());
        }
        assert_eq!(low[0].count + high[0].count, 5);
        assert_eq!(low[1].count + high[1].count, 3);
    }

    #[tokio::test]
    async fn test_non_numeric_values_land_in_high_bucket() {
        let ctx = context_with(vec![
            json!({"age": 10}),
            json!({"age": "unknown"}),
            json!({"age": 30}),
        ])
        .await;
        StatisticsStage.execute(&ctx).await.unwrap();
        let result = PartitionStage.execute(&ctx).await.unwrap();
        assert!(result.message.contains("1 non-numeric"));

        let low = buckets(&ctx, &ctx.collections.low_partition).await;
        let high = buckets(&ctx, &ctx.collections.high_partition).await;
        // mean over the numeric values is 20
        assert_eq!(low[0].values, vec![json!(10)]);
        assert_eq!(high[0].values, vec![json!("unknown"), json!(30)]);
        assert_eq!(low[0].count + high[0].count, 3);
    }

    #[tokio::test]
    async fn test_missing_statistic_is_fatal() {
        let ctx = context_with(vec![json!({"age": 10})]).await;
        let err = PartitionStage.execute(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            EtlError::MissingDependency {
                stage: "partition",
                ..
            }
        ));
    }
}
