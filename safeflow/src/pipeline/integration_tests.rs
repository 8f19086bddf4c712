//! End-to-end tests for pipeline execution.

#[cfg(test)]
mod tests {
    use crate::compensation::{AuditEvent, ResourceType};
    use crate::context::{keys, PipelineContext};
    use crate::errors::{ErrorKind, ExternalError, PipelineError, StageFailure};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{PipelineBuilder, PipelineExecutor, RunStatus};
    use crate::resilience::{BreakerConfig, BreakerRegistry, CallGuard, CircuitState, RetryPolicy};
    use crate::stages::ports::MockSearchIndex;
    use crate::stages::{
        DedupeStage, ExtractStage, HashStage, IndexStage, PersistStage, Stage, UploadStage,
    };
    use crate::testing::{
        CommitStage, FailingStage, InMemoryBlobStore, InMemoryRecordStore, InMemorySearchIndex,
        RecordingStage, ScriptedInference, ShortCircuitStage, StageLog,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        blobs: Arc<InMemoryBlobStore>,
        index: Arc<InMemorySearchIndex>,
        records: InMemoryRecordStore,
        inference: Arc<ScriptedInference>,
        registry: BreakerRegistry,
        sink: Arc<CollectingEventSink>,
    }

    impl Harness {
        fn new(records: InMemoryRecordStore, inference: ScriptedInference) -> Self {
            let sink = Arc::new(CollectingEventSink::new());
            Self {
                blobs: Arc::new(InMemoryBlobStore::new()),
                index: Arc::new(InMemorySearchIndex::new()),
                records,
                inference: Arc::new(inference),
                registry: BreakerRegistry::new(BreakerConfig::new(5, Duration::from_secs(30)))
                    .with_event_sink(sink.clone()),
                sink,
            }
        }

        fn standard() -> Self {
            Self::new(
                InMemoryRecordStore::new(),
                ScriptedInference::new(json!({"vendor": "ACME", "total": 42})),
            )
        }

        fn guard(&self, dependency: &str, policy: RetryPolicy) -> CallGuard {
            CallGuard::new(self.registry.get_or_create(dependency), policy)
                .with_event_sink(self.sink.clone())
        }

        fn upload(&self, policy: RetryPolicy) -> Arc<dyn Stage> {
            Arc::new(UploadStage::new(self.blobs.clone(), self.guard("blob_store", policy)))
        }

        fn extract(&self, policy: RetryPolicy) -> Arc<dyn Stage> {
            Arc::new(ExtractStage::new(self.inference.clone(), self.guard("inference", policy)))
        }

        fn index_stage(&self, policy: RetryPolicy) -> Arc<dyn Stage> {
            Arc::new(IndexStage::new(self.index.clone(), self.guard("search_index", policy)))
        }

        fn persist(&self) -> Arc<dyn Stage> {
            Arc::new(PersistStage::new(Arc::new(self.records.clone())))
        }

        fn document_pipeline(&self, policy: RetryPolicy) -> PipelineExecutor {
            PipelineBuilder::new("documents")
                .stage(Arc::new(HashStage::new()))
                .stage(Arc::new(DedupeStage::new(Arc::new(self.records.clone()))))
                .stage(self.upload(policy.clone()))
                .stage(self.extract(policy.clone()))
                .stage(self.persist())
                .stage(self.index_stage(policy))
                .event_sink(self.sink.clone())
                .build()
                .unwrap()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false)
    }

    fn sha256_hex(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    fn failure_of(err: &PipelineError) -> (&str, &StageFailure) {
        let stage_err = err.stage_error().unwrap();
        (stage_err.stage.as_str(), &stage_err.source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_commits_without_compensation() {
        let h = Harness::standard();
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("invoice.pdf", b"%PDF invoice".to_vec());

        let outcome = assert_ok!(pipeline.run(&mut ctx).await);

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(!outcome.is_degraded());
        assert!(ctx.get_str(keys::RECORD_ID).is_some());
        assert!(ctx.get_str(keys::INDEX_ENTRY_ID).is_some());
        assert_eq!(h.records.committed().len(), 1);
        assert_eq!(h.blobs.len(), 1);
        assert_eq!(h.index.len(), 1);
        assert!(h.blobs.deleted().is_empty());
        assert_eq!(h.sink.count("compensation.succeeded"), 0);
        assert_eq!(h.sink.count("pipeline.completed"), 1);
        assert!(outcome
            .audit
            .iter()
            .all(|e| e.event != AuditEvent::Compensated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_unwinds_upload_only() {
        let h = Harness::new(
            InMemoryRecordStore::new().with_failing_commit(),
            ScriptedInference::new(json!({"total": 1})),
        );
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("scan.pdf", b"scan".to_vec());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        let (stage, failure) = failure_of(&err);
        assert_eq!(stage, "persist");
        assert!(matches!(failure, StageFailure::External(e) if e.kind == ErrorKind::Connection));
        assert_eq!(h.blobs.deleted(), vec!["file-1".to_string()]);
        assert!(h.blobs.is_empty());
        assert!(h.index.is_empty());
        assert_eq!(h.sink.count("compensation.succeeded"), 1);
        assert_eq!(ctx.error(), Some(err.to_string().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_inference_errors_are_retried() {
        let h = Harness::new(
            InMemoryRecordStore::new(),
            ScriptedInference::new(json!({"total": 7}))
                .then(Err(ExternalError::rate_limited("429")))
                .then(Err(ExternalError::connection("reset by peer"))),
        );
        let pipeline = h.document_pipeline(fast_policy(5));
        let mut ctx = PipelineContext::new("receipt.jpg", b"jpeg".to_vec());

        let outcome = assert_ok!(pipeline.run(&mut ctx).await);

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(h.inference.calls(), 3);
        assert_eq!(ctx.get(keys::EXTRACTED), Some(&json!({"total": 7})));
        assert_eq!(h.sink.count("retry.scheduled"), 2);
        assert_eq!(
            h.registry.get("inference").unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_inference_error_is_not_retried() {
        let h = Harness::standard();
        h.inference
            .set_outage(Some(ExternalError::unauthorized("invalid api key")));
        let pipeline = h.document_pipeline(fast_policy(5));
        let mut ctx = PipelineContext::new("a.pdf", b"a".to_vec());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        let (stage, failure) = failure_of(&err);
        assert_eq!(stage, "extract");
        assert!(matches!(failure, StageFailure::External(e) if e.kind == ErrorKind::Unauthorized));
        assert_eq!(h.inference.calls(), 1);
        assert_eq!(h.blobs.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_protects_downstream() {
        let h = Harness::standard();
        h.blobs
            .set_upload_outage(Some(ExternalError::from_status(503, "unavailable")));
        let pipeline = h.document_pipeline(RetryPolicy::no_retry());

        for i in 0..5 {
            let mut ctx = PipelineContext::new(format!("doc-{i}"), format!("doc-{i}").into_bytes());
            let err = assert_err!(pipeline.run(&mut ctx).await);
            assert!(matches!(failure_of(&err).1, StageFailure::External(_)));
        }
        assert_eq!(h.blobs.upload_calls(), 5);
        assert_eq!(
            h.registry.get("blob_store").unwrap().state(),
            CircuitState::Open
        );

        for i in 5..15 {
            let mut ctx = PipelineContext::new(format!("doc-{i}"), format!("doc-{i}").into_bytes());
            let err = assert_err!(pipeline.run(&mut ctx).await);
            let (stage, failure) = failure_of(&err);
            assert_eq!(stage, "upload");
            assert!(matches!(
                failure,
                StageFailure::CircuitOpen { dependency } if dependency == "blob_store"
            ));
        }

        assert_eq!(h.blobs.upload_calls(), 5);
        assert_eq!(h.sink.count("breaker.opened"), 1);
        assert_eq!(h.sink.count("breaker.rejected"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_short_circuits_without_unwind() {
        let content = b"already seen".to_vec();
        let h = Harness::new(
            InMemoryRecordStore::new().with_existing("rec-1", sha256_hex(&content)),
            ScriptedInference::new(json!({})),
        );
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("dup.pdf", content);

        let outcome = assert_ok!(pipeline.run(&mut ctx).await);

        assert_eq!(
            outcome.status,
            RunStatus::ShortCircuited {
                stage: "dedupe".to_string(),
                reason: "duplicate of rec-1".to_string(),
            }
        );
        assert_eq!(ctx.get_str(keys::DUPLICATE_OF), Some("rec-1"));
        assert_eq!(h.blobs.upload_calls(), 0);
        assert_eq!(h.inference.calls(), 0);
        assert_eq!(h.sink.count("transaction.committed"), 1);
        assert_eq!(h.sink.count("transaction.unwound"), 0);
        assert_eq!(h.sink.count("pipeline.short_circuited"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_before_persist_unwinds_in_reverse() {
        let h = Harness::new(
            InMemoryRecordStore::new().with_failing_commit(),
            ScriptedInference::new(json!({"total": 3})),
        );
        let pipeline = PipelineBuilder::new("index-first")
            .stage(Arc::new(HashStage::new()))
            .stage(h.upload(fast_policy(3)))
            .stage(h.extract(fast_policy(3)))
            .stage(h.index_stage(fast_policy(3)))
            .stage(h.persist())
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("b.pdf", b"b".to_vec());
        let tx = pipeline.transaction_for(&ctx);

        assert_err!(pipeline.run_in(&mut ctx, &tx).await);

        let order: Vec<Option<ResourceType>> = tx
            .audit_log()
            .entries_of(AuditEvent::Compensated)
            .iter()
            .map(|e| e.resource_type)
            .collect();
        assert_eq!(
            order,
            vec![Some(ResourceType::SearchIndex), Some(ResourceType::BlobStore)]
        );
        assert_eq!(h.index.removed().len(), 1);
        assert_eq!(h.blobs.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_failure_after_commit() {
        let h = Harness::standard();
        h.index
            .set_add_outage(Some(ExternalError::bad_request("mapping rejected")));
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("c.pdf", b"c".to_vec());

        let outcome = assert_ok!(pipeline.run(&mut ctx).await);

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.degraded.len(), 1);
        assert_eq!(outcome.degraded[0].stage, "index");
        assert_eq!(h.records.committed().len(), 1);
        assert_eq!(h.blobs.len(), 1);
        assert!(h.blobs.deleted().is_empty());
        assert_eq!(h.sink.count("stage.best_effort_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compensation_failure_does_not_mask_error() {
        let h = Harness::new(
            InMemoryRecordStore::new().with_failing_commit(),
            ScriptedInference::new(json!({})),
        );
        h.blobs
            .fail_deletes([ExternalError::from_status(500, "delete failed")]);
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("d.pdf", b"d".to_vec());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        assert_eq!(failure_of(&err).0, "persist");
        assert_eq!(h.sink.count("compensation.orphaned"), 1);
        assert_eq!(h.blobs.len(), 1);

        let failed = h.sink.events_of_type("pipeline.failed");
        let orphaned = failed[0].1.as_ref().map(|d| d["orphaned"].clone());
        assert_eq!(orphaned, Some(json!(["file-1"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_retries() {
        let h = Harness::standard();
        h.inference
            .set_outage(Some(ExternalError::rate_limited("busy")));
        let policy = RetryPolicy::new()
            .with_max_attempts(10)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);
        let pipeline = h.document_pipeline(policy);
        let mut ctx = PipelineContext::new("e.pdf", b"e".to_vec())
            .with_timeout(Duration::from_millis(2_500));

        let err = assert_err!(pipeline.run(&mut ctx).await);

        let (stage, failure) = failure_of(&err);
        assert_eq!(stage, "extract");
        assert!(matches!(
            failure,
            StageFailure::DeadlineExceeded { attempts: 2, .. }
        ));
        assert_eq!(h.inference.calls(), 2);
        assert_eq!(h.blobs.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_fails_before_first_stage() {
        let h = Harness::standard();
        let pipeline = h.document_pipeline(fast_policy(3));
        let mut ctx = PipelineContext::new("f.pdf", b"f".to_vec()).with_timeout(Duration::ZERO);

        let err = assert_err!(pipeline.run(&mut ctx).await);

        let (stage, failure) = failure_of(&err);
        assert_eq!(stage, "hash");
        assert!(matches!(failure, StageFailure::DeadlineExceeded { attempts: 0, .. }));
        assert!(!ctx.contains(keys::CONTENT_HASH));
    }

    #[tokio::test]
    async fn test_recorded_rollbacks_run_lifo() {
        let log = StageLog::default();
        let pipeline = PipelineBuilder::new("lifo")
            .stage(Arc::new(RecordingStage::new("A", log.clone()).with_rollback()))
            .stage(Arc::new(RecordingStage::new("B", log.clone()).with_rollback()))
            .stage(Arc::new(RecordingStage::new("C", log.clone()).with_rollback()))
            .stage(Arc::new(FailingStage::new("D", ExternalError::validation("bad"))))
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("g", Vec::new());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        assert_eq!(failure_of(&err).0, "D");
        assert_eq!(
            *log.lock(),
            vec!["run:A", "run:B", "run:C", "undo:C", "undo:B", "undo:A"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_remaining_stages() {
        let log = StageLog::default();
        let failing = Arc::new(FailingStage::new("never", ExternalError::server("boom")));
        let pipeline = PipelineBuilder::new("short")
            .stage(Arc::new(RecordingStage::new("A", log.clone()).with_rollback()))
            .stage(Arc::new(ShortCircuitStage::new("stop", "nothing to do")))
            .stage(failing.clone())
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("h", Vec::new());

        let outcome = assert_ok!(pipeline.run(&mut ctx).await);

        assert!(outcome.is_short_circuited());
        assert_eq!(failing.calls(), 0);
        assert_eq!(*log.lock(), vec!["run:A"]);
    }

    #[tokio::test]
    async fn test_non_best_effort_failure_after_commit_fails_run() {
        let log = StageLog::default();
        let pipeline = PipelineBuilder::new("committed")
            .stage(Arc::new(RecordingStage::new("A", log.clone()).with_rollback()))
            .stage(Arc::new(CommitStage::new("commit")))
            .stage(Arc::new(FailingStage::new("notify", ExternalError::server("down"))))
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("i", Vec::new());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        assert_eq!(failure_of(&err).0, "notify");
        assert_eq!(*log.lock(), vec!["run:A"]);
    }

    #[tokio::test]
    async fn test_best_effort_failure_before_commit_unwinds() {
        let log = StageLog::default();
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("early")
            .stage(Arc::new(RecordingStage::new("A", log.clone()).with_rollback()))
            .stage(Arc::new(
                FailingStage::new("index", ExternalError::server("down")).best_effort(),
            ))
            .event_sink(sink.clone())
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("k", Vec::new());

        let err = assert_err!(pipeline.run(&mut ctx).await);

        assert_eq!(failure_of(&err).0, "index");
        assert_eq!(*log.lock(), vec!["run:A", "undo:A"]);
        assert_eq!(sink.count("stage.best_effort_failed"), 0);
        assert_eq!(sink.count("pipeline.failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mocked_index_rollback_on_failure() {
        let h = Harness::standard();
        let mut index = MockSearchIndex::new();
        index
            .expect_add_entry()
            .times(1)
            .returning(|_, _| Ok("entry-42".to_string()));
        index
            .expect_remove_entry()
            .with(mockall::predicate::eq("entry-42"))
            .times(1)
            .returning(|_| Ok(()));
        let pipeline = PipelineBuilder::new("mocked")
            .stage(Arc::new(HashStage::new()))
            .stage(Arc::new(IndexStage::new(
                Arc::new(index),
                h.guard("search_index", fast_policy(3)),
            )))
            .stage(Arc::new(FailingStage::new("after", ExternalError::validation("nope"))))
            .build()
            .unwrap();
        let mut ctx = PipelineContext::new("j", b"j".to_vec());

        assert_err!(pipeline.run(&mut ctx).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_share_breakers() {
        let h = Harness::standard();
        let pipeline = Arc::new(h.document_pipeline(fast_policy(3)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    let mut ctx =
                        PipelineContext::new(format!("doc-{i}"), format!("content-{i}").into_bytes());
                    pipeline.run(&mut ctx).await.map(|o| o.status)
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().unwrap(), RunStatus::Completed);
        }

        assert_eq!(h.records.committed().len(), 8);
        assert_eq!(h.blobs.len(), 8);
        assert_eq!(h.registry.len(), 3);
        assert_eq!(
            h.registry.get("blob_store").unwrap().consecutive_failures(),
            0
        );
    }
}
