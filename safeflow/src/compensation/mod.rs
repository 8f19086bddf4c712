//! Compensating transactions for multi-step writes across external systems.
//!
//! This module provides:
//! - Rollback handlers describing how to undo one created resource
//! - A transaction that runs them in reverse order on failure
//! - An append-only audit trail of every registration and compensation

mod audit;
mod handler;
mod transaction;
#[cfg(test)]
mod transaction_tests;

pub use audit::{AuditEntry, AuditEvent, AuditLog, AuditOutcome};
pub use handler::{HandlerId, ResourceType, RollbackAction, RollbackHandler};
pub use transaction::{
    CompensatingTransaction, CompensationConfig, FailedCompensation, TransactionStatus,
    UnwindReport,
};
