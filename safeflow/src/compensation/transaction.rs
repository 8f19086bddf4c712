//! Compensating transaction: LIFO undo of external side effects.

use super::audit::{AuditDraft, AuditEntry, AuditEvent, AuditLog};
use super::handler::{HandlerId, ResourceType, RollbackAction, RollbackHandler};
use crate::errors::CompensationError;
use crate::events::{noop_sink, EventSink};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for compensation execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    /// Upper bound for one compensation action, in milliseconds.
    pub handler_timeout_ms: u64,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 30_000,
        }
    }
}

impl CompensationConfig {
    /// Sets the per-handler timeout.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the per-handler timeout.
    #[must_use]
    pub const fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Accepting registrations.
    Active,
    /// Committed; nothing will be undone.
    Committed,
    /// Handlers have been executed.
    Unwound,
}

/// A compensation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCompensation {
    /// Handler that failed.
    pub handler_id: HandlerId,
    /// Kind of resource left behind.
    pub resource_type: ResourceType,
    /// Identifier of the resource left behind.
    pub resource_id: String,
    /// Whether the handler was critical.
    pub critical: bool,
    /// Why it failed.
    pub reason: String,
}

/// Summary of one unwind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwindReport {
    /// Handlers executed.
    pub attempted: usize,
    /// Handlers that succeeded.
    pub succeeded: usize,
    /// Handlers that failed, in execution order.
    pub failed: Vec<FailedCompensation>,
    /// True if the transaction was already committed and nothing ran.
    pub skipped: bool,
}

impl UnwindReport {
    /// Returns true if every attempted compensation succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failed critical compensations: resources that must be cleaned up by hand.
    pub fn orphaned(&self) -> impl Iterator<Item = &FailedCompensation> {
        self.failed.iter().filter(|f| f.critical)
    }
}

struct TxState {
    status: TransactionStatus,
    handlers: Vec<(HandlerId, RollbackHandler)>,
    next_id: u64,
}

/// Tracks undo actions for resources created during one unit of work.
///
/// Handlers run in strict reverse registration order when the unit fails.
/// A failing handler never stops the unwind and never replaces the error
/// that triggered it; failures end up in the audit log and event sink.
///
/// All methods take `&self`, so a stage can register handlers while the
/// executor holds the transaction.
pub struct CompensatingTransaction {
    id: Uuid,
    name: String,
    config: CompensationConfig,
    state: Mutex<TxState>,
    audit: AuditLog,
    event_sink: Arc<dyn EventSink>,
}

impl CompensatingTransaction {
    /// Creates an active transaction.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            config: CompensationConfig::default(),
            state: Mutex::new(TxState {
                status: TransactionStatus::Active,
                handlers: Vec::new(),
                next_id: 0,
            }),
            audit: AuditLog::new(),
            event_sink: noop_sink(),
        }
    }

    /// Sets the compensation config.
    #[must_use]
    pub fn with_config(mut self, config: CompensationConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the transaction ID.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the transaction name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Returns true once committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status() == TransactionStatus::Committed
    }

    /// Returns the number of handlers waiting to run on unwind.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Returns the audit log.
    #[must_use]
    pub const fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Returns a copy of the audit entries.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    /// Registers an undo action for a resource that now exists.
    ///
    /// Call this right after the side effect is durable, before the next
    /// step runs.
    pub fn register_rollback<F, Fut>(
        &self,
        action: F,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        description: impl Into<String>,
        critical: bool,
    ) -> HandlerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CompensationError>> + Send + 'static,
    {
        self.register(
            RollbackHandler::new(resource_type, resource_id, action)
                .with_description(description)
                .with_critical(critical),
        )
    }

    /// Registers a prepared handler.
    ///
    /// After commit or unwind the handler is dropped without running; the
    /// drop is recorded in the audit log.
    pub fn register(&self, handler: RollbackHandler) -> HandlerId {
        let resource_type = handler.resource_type;
        let resource_id = handler.resource_id.clone();
        let critical = handler.critical;

        let (id, status) = {
            let mut state = self.state.lock();
            let id = HandlerId(state.next_id);
            state.next_id += 1;
            let status = state.status;
            if status == TransactionStatus::Active {
                state.handlers.push((id, handler));
            }
            (id, status)
        };

        let draft = AuditDraft::new(if status == TransactionStatus::Active {
            AuditEvent::Registered
        } else {
            AuditEvent::RegistrationDropped
        })
        .resource(id, resource_type, &resource_id, critical);

        match status {
            TransactionStatus::Active => {
                debug!(
                    transaction = %self.name,
                    handler = %id,
                    resource_type = %resource_type,
                    resource_id = %resource_id,
                    "Registered rollback handler"
                );
                let entry = self.audit.append(draft);
                self.event_sink
                    .try_emit("compensation.registered", Some(entry.to_event(&self.name)));
            }
            TransactionStatus::Committed => {
                warn!(
                    transaction = %self.name,
                    resource_id = %resource_id,
                    "Rollback registered after commit; dropping handler"
                );
                self.audit.append(draft);
            }
            TransactionStatus::Unwound => {
                warn!(
                    transaction = %self.name,
                    resource_id = %resource_id,
                    "Rollback registered after unwind; resource is not tracked"
                );
                self.audit.append(draft.failed("transaction already unwound"));
            }
        }
        id
    }

    /// Marks the transaction committed. Pending handlers are discarded.
    ///
    /// Returns true if this call performed the commit.
    pub fn commit(&self) -> bool {
        let discarded = {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::Active {
                return false;
            }
            state.status = TransactionStatus::Committed;
            std::mem::take(&mut state.handlers).len()
        };

        info!(transaction = %self.name, discarded, "Transaction committed");
        let entry = self.audit.append(AuditDraft::new(AuditEvent::Committed));
        self.event_sink
            .try_emit("transaction.committed", Some(entry.to_event(&self.name)));
        true
    }

    /// Runs every pending handler in reverse registration order.
    ///
    /// Does nothing on a committed transaction. Each handler runs at most
    /// once, so a second unwind is a no-op.
    pub async fn unwind(&self) -> UnwindReport {
        let handlers = {
            let mut state = self.state.lock();
            if state.status == TransactionStatus::Committed {
                None
            } else {
                state.status = TransactionStatus::Unwound;
                Some(std::mem::take(&mut state.handlers))
            }
        };

        let Some(handlers) = handlers else {
            debug!(transaction = %self.name, "Unwind requested after commit; skipping");
            self.audit.append(AuditDraft::new(AuditEvent::UnwindSkipped));
            return UnwindReport {
                skipped: true,
                ..UnwindReport::default()
            };
        };

        info!(transaction = %self.name, handlers = handlers.len(), "Unwinding");
        self.audit.append(AuditDraft::new(AuditEvent::UnwindStarted));

        let mut report = UnwindReport::default();
        for (id, handler) in handlers.into_iter().rev() {
            let RollbackHandler {
                action,
                resource_type,
                resource_id,
                description,
                critical,
            } = handler;
            report.attempted += 1;

            let draft = AuditDraft::new(AuditEvent::Compensated).resource(
                id,
                resource_type,
                &resource_id,
                critical,
            );

            match self.run_action(action).await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(transaction = %self.name, handler = %id, %description, "Compensation succeeded");
                    let entry = self.audit.append(draft);
                    self.event_sink
                        .try_emit("compensation.succeeded", Some(entry.to_event(&self.name)));
                }
                Err(reason) => {
                    let entry = self.audit.append(draft.failed(reason.clone()));
                    if critical {
                        error!(
                            alert = "orphaned_resource",
                            transaction = %self.name,
                            handler = %id,
                            resource_type = %resource_type,
                            resource_id = %resource_id,
                            %description,
                            %reason,
                            "Critical compensation failed"
                        );
                        self.event_sink
                            .try_emit("compensation.orphaned", Some(entry.to_event(&self.name)));
                    } else {
                        warn!(
                            transaction = %self.name,
                            handler = %id,
                            resource_id = %resource_id,
                            %reason,
                            "Compensation failed"
                        );
                        self.event_sink
                            .try_emit("compensation.failed", Some(entry.to_event(&self.name)));
                    }
                    report.failed.push(FailedCompensation {
                        handler_id: id,
                        resource_type,
                        resource_id,
                        critical,
                        reason,
                    });
                }
            }
        }

        let completed = AuditDraft::new(AuditEvent::UnwindCompleted);
        let completed = if report.is_clean() {
            completed
        } else {
            completed.failed(format!("{} compensation(s) failed", report.failed.len()))
        };
        let entry = self.audit.append(completed);
        let mut event = entry.to_event(&self.name);
        if let Some(map) = event.as_object_mut() {
            map.insert("attempted".to_string(), serde_json::json!(report.attempted));
            map.insert("succeeded".to_string(), serde_json::json!(report.succeeded));
            map.insert("failed".to_string(), serde_json::json!(report.failed.len()));
        }
        self.event_sink.try_emit("transaction.unwound", Some(event));

        report
    }

    /// Unwinds, then hands back `error` unchanged.
    pub async fn fail<E>(&self, error: E) -> E {
        self.unwind().await;
        error
    }

    /// Runs `work` inside the transaction scope.
    ///
    /// Commits on `Ok`. On `Err` unwinds and returns the original error.
    ///
    /// # Errors
    ///
    /// Returns whatever `work` returned.
    pub async fn protect<T, E, Fut>(&self, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match work.await {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn run_action(&self, action: RollbackAction) -> Result<(), String> {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(future) => future,
            Err(panic) => return Err(format!("compensation panicked: {}", panic_message(&*panic))),
        };

        let timeout = self.config.handler_timeout();
        match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(panic)) => Err(format!("compensation panicked: {}", panic_message(&*panic))),
            Err(_) => Err(format!("compensation timed out after {}ms", timeout.as_millis())),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Drop for CompensatingTransaction {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status == TransactionStatus::Active && !state.handlers.is_empty() {
            warn!(
                transaction = %self.name,
                pending = state.handlers.len(),
                "Transaction dropped without commit or unwind; compensations discarded"
            );
        }
    }
}

impl std::fmt::Debug for CompensatingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensatingTransaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .finish()
    }
}
