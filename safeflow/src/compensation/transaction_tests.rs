//! Tests for compensating transactions.

#[cfg(test)]
mod tests {
    use crate::compensation::{
        AuditEvent, CompensatingTransaction, CompensationConfig, ResourceType, RollbackHandler,
        TransactionStatus,
    };
    use crate::errors::{CompensationError, ExternalError};
    use crate::events::CollectingEventSink;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn push(trace: &Trace, label: &str) {
        trace.lock().push(label.to_string());
    }

    fn register_recording(tx: &CompensatingTransaction, trace: &Trace, label: &'static str) {
        let trace = trace.clone();
        tx.register_rollback(
            move || async move {
                push(&trace, label);
                Ok(())
            },
            ResourceType::Other,
            label,
            format!("undo {label}"),
            false,
        );
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");
        register_recording(&tx, &trace, "B");
        register_recording(&tx, &trace, "C");

        let report = tx.unwind().await;

        assert_eq!(*trace.lock(), vec!["C", "B", "A"]);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 3);
        assert!(report.is_clean());
        assert_eq!(tx.status(), TransactionStatus::Unwound);
    }

    #[tokio::test]
    async fn test_unwind_with_no_handlers() {
        let tx = CompensatingTransaction::new("run");
        let report = tx.unwind().await;
        assert_eq!(report.attempted, 0);
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_unwind_single_handler() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "only");

        tx.unwind().await;
        assert_eq!(*trace.lock(), vec!["only"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_unwind() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");
        {
            let trace = trace.clone();
            tx.register_rollback(
                move || async move {
                    push(&trace, "B");
                    Err(CompensationError::from(ExternalError::server("store down")))
                },
                ResourceType::BlobStore,
                "file-b",
                "delete file-b",
                false,
            );
        }
        register_recording(&tx, &trace, "C");

        let report = tx.unwind().await;

        assert_eq!(*trace.lock(), vec!["C", "B", "A"]);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource_id, "file-b");
        assert!(report.failed[0].reason.contains("store down"));
        assert_eq!(report.orphaned().count(), 0);
    }

    async fn explode() -> Result<(), CompensationError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");
        tx.register_rollback(
            explode,
            ResourceType::Other,
            "panicky",
            "panics",
            false,
        );

        let report = tx.unwind().await;

        assert_eq!(*trace.lock(), vec!["A"]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("panicked"));
        assert!(report.failed[0].reason.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let tx = CompensatingTransaction::new("run").with_config(
            CompensationConfig::default().with_handler_timeout(Duration::from_millis(100)),
        );
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");
        tx.register_rollback(
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            ResourceType::SearchIndex,
            "entry-1",
            "remove entry-1",
            false,
        );

        let report = tx.unwind().await;

        assert_eq!(*trace.lock(), vec!["A"]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_critical_failure_is_escalated() {
        let sink = Arc::new(CollectingEventSink::new());
        let tx = CompensatingTransaction::new("run").with_event_sink(sink.clone());
        tx.register(
            RollbackHandler::new(ResourceType::BlobStore, "file-1", || async {
                Err(CompensationError::new("permission denied"))
            })
            .critical(),
        );
        tx.register(RollbackHandler::new(ResourceType::SearchIndex, "entry-1", || async {
            Err(CompensationError::new("not found"))
        }));

        let report = tx.unwind().await;

        assert_eq!(report.orphaned().count(), 1);
        assert_eq!(sink.count("compensation.orphaned"), 1);
        assert_eq!(sink.count("compensation.failed"), 1);
        assert_eq!(sink.count("transaction.unwound"), 1);

        let orphaned = &sink.events_of_type("compensation.orphaned")[0];
        let data = orphaned.1.as_ref().map(|d| d["resource_id"].clone());
        assert_eq!(data, Some(serde_json::json!("file-1")));
    }

    #[tokio::test]
    async fn test_commit_discards_handlers() {
        let tx = CompensatingTransaction::new("run");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        tx.register_rollback(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ResourceType::Other,
            "r1",
            "undo r1",
            false,
        );

        assert!(tx.commit());
        assert_eq!(tx.pending_count(), 0);
        assert!(!tx.commit());

        let report = tx.unwind().await;
        assert!(report.skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tx.audit_log().entries_of(AuditEvent::UnwindSkipped).len(), 1);
    }

    #[tokio::test]
    async fn test_registration_after_commit_is_dropped() {
        let tx = CompensatingTransaction::new("run");
        tx.commit();

        let trace = Trace::default();
        register_recording(&tx, &trace, "late");

        assert_eq!(tx.pending_count(), 0);
        assert_eq!(tx.audit_log().entries_of(AuditEvent::RegistrationDropped).len(), 1);
        tx.unwind().await;
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handlers_run_at_most_once() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");

        tx.unwind().await;
        let second = tx.unwind().await;

        assert_eq!(*trace.lock(), vec!["A"]);
        assert_eq!(second.attempted, 0);
    }

    #[tokio::test]
    async fn test_protect_commits_on_success() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");

        let result: Result<u32, ExternalError> = tx.protect(async { Ok(7) }).await;

        assert_eq!(result.ok(), Some(7));
        assert!(tx.is_committed());
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn test_protect_returns_original_error() {
        let tx = CompensatingTransaction::new("run");
        tx.register_rollback(
            || async { Err(CompensationError::new("cleanup failed too")) },
            ResourceType::Other,
            "r1",
            "undo r1",
            true,
        );

        let result: Result<(), ExternalError> = tx
            .protect(async { Err(ExternalError::validation("bad payload")) })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.message, "bad payload");
        assert_eq!(tx.status(), TransactionStatus::Unwound);
    }

    #[tokio::test]
    async fn test_audit_trail_records_lifecycle() {
        let tx = CompensatingTransaction::new("run");
        let trace = Trace::default();
        register_recording(&tx, &trace, "A");
        register_recording(&tx, &trace, "B");
        tx.unwind().await;

        let events: Vec<AuditEvent> = tx.audit_entries().iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                AuditEvent::Registered,
                AuditEvent::Registered,
                AuditEvent::UnwindStarted,
                AuditEvent::Compensated,
                AuditEvent::Compensated,
                AuditEvent::UnwindCompleted,
            ]
        );
        let compensated = tx.audit_log().entries_of(AuditEvent::Compensated);
        assert_eq!(compensated[0].resource_id.as_deref(), Some("B"));
        assert_eq!(compensated[1].resource_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_handler_timeout_saturates() {
        let config = CompensationConfig::default().with_handler_timeout(Duration::MAX);
        assert_eq!(config.handler_timeout_ms, u64::MAX);
    }
}
