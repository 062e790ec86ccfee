use super::report::{fingerprint, RunReport, StageRecord};
use super::stages::default_stages;
use super::{PipelineStage, StageContext};
use crate::error::{EtlError, Result};
use metrics::{counter, histogram};
use std::time::Instant;
use tracing::{info, instrument};

/// Runs Stage 0 (reset of derived collections) and Stages 1-8 in strict order.
///
/// The first failing stage aborts the run: nothing is retried or rolled back,
/// and derived collections are left as the failed stage found them.
pub struct BatchTransformer {
    ctx: StageContext,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl std::fmt::Debug for BatchTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTransformer")
            .field("ctx", &self.ctx)
            .field(
                "stages",
                &self.stages.iter().map(|s| s.stage_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BatchTransformer {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            stages: default_stages(),
        }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Clear the six derived collections so the run rebuilds them from scratch
    pub async fn reset_derived(&self) -> Result<u64> {
        let mut removed = 0;
        for collection in self.ctx.collections.derived() {
            removed += self.ctx.store.clear(collection).await?;
        }
        Ok(removed)
    }

    #[instrument(skip(self), fields(engine = %self.ctx.store.engine()))]
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::new(self.ctx.store.engine());
        info!("🚀 Starting batch run {}", report.run_id);
        counter!("etl_runs_total").increment(1);
        let t_run = Instant::now();

        report.reset_documents = self.reset_derived().await?;
        info!(
            "🧹 Reset derived collections ({} documents removed)",
            report.reset_documents
        );

        for stage in &self.stages {
            let number = stage.stage_number();
            let name = stage.stage_name();
            info!("🔄 Executing stage {}/{}: {}", number, self.stages.len(), name);

            let t_stage = Instant::now();
            // logged once by the caller
            let result = stage.execute(&self.ctx).await.map_err(|e| {
                counter!("etl_stage_failures_total", "stage" => name).increment(1);
                EtlError::StageFailed {
                    number,
                    stage: name,
                    source: Box::new(e),
                }
            })?;
            let elapsed = t_stage.elapsed();

            histogram!("etl_stage_duration_seconds", "stage" => name).record(elapsed.as_secs_f64());
            counter!("etl_documents_written_total", "stage" => name)
                .increment(result.written_count as u64);
            info!("✅ Stage {} ({}) completed: {}", number, name, result.message);

            report.stages.push(StageRecord {
                number,
                name: name.to_string(),
                processed_count: result.processed_count,
                written_count: result.written_count,
                duration_ms: elapsed.as_millis() as u64,
                message: result.message,
            });
        }

        for collection in self.ctx.collections.derived() {
            let docs = self.ctx.store.find_all(collection).await?;
            report
                .fingerprints
                .insert(collection.to_string(), fingerprint(&docs)?);
        }

        report.complete();
        histogram!("etl_run_duration_seconds").record(t_run.elapsed().as_secs_f64());
        info!(
            "🎉 Batch run {} completed in {:.2}s",
            report.run_id,
            t_run.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::context_with;
    use crate::pipeline::StageResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::error::Error as _;

    struct MissingInputStage;

    #[async_trait]
    impl PipelineStage for MissingInputStage {
        fn stage_number(&self) -> u8 {
            4
        }

        fn stage_name(&self) -> &'static str {
            "partition"
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<StageResult> {
            Err(EtlError::MissingDependency {
                stage: "partition",
                what: "statistic for variable 'age'".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_run_executes_all_stages_in_order() {
        let ctx = context_with(vec![
            json!({"age": 10, "test_time": 1.5, "sex": 0}),
            json!({"age": 20, "sex": 1}),
            json!({"age": 30, "test_time": 2.5}),
        ])
        .await;
        let transformer = BatchTransformer::new(ctx);
        let report = transformer.run().await.unwrap();

        let numbers: Vec<u8> = report.stages.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(report.fingerprints.len(), 6);
        assert!(report.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_rerun_clears_previous_outputs() {
        let ctx = context_with(vec![json!({"age": 10, "sex": 0}), json!({"age": 20, "sex": 1})]).await;
        let transformer = BatchTransformer::new(ctx);
        let first = transformer.run().await.unwrap();
        let second = transformer.run().await.unwrap();

        assert_eq!(first.reset_documents, 0);
        assert!(second.reset_documents > 0);
        assert_eq!(first.fingerprints, second.fingerprints);

        let ctx = transformer.context();
        assert_eq!(ctx.store.count(&ctx.collections.statistical_embed).await.unwrap(), 2);
        assert_eq!(ctx.store.count(&ctx.collections.frequencies).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_aborts_run() {
        let ctx = context_with(vec![json!({"age": 10})]).await;
        ctx.store.close().await.unwrap();
        let transformer = BatchTransformer::new(ctx);
        let err = transformer.run().await.unwrap_err();
        // closed before Stage 0, so the reset itself fails
        assert!(matches!(err, EtlError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_stage_failure_wraps_source_once() {
        let ctx = context_with(vec![json!({"age": 10})]).await;
        let transformer = BatchTransformer {
            ctx,
            stages: vec![Box::new(MissingInputStage)],
        };
        let err = transformer.run().await.unwrap_err();

        assert!(matches!(err, EtlError::StageFailed { number: 4, stage: "partition", .. }));
        // the message names the stage; the cause is reachable once through source()
        let message = err.to_string();
        assert_eq!(message, "Stage 4 (partition) failed");
        let source = err.source().unwrap().to_string();
        assert!(source.contains("statistic for variable 'age'"));
        assert!(!message.contains(&source));
    }
}
