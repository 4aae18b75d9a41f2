//! Audit trail for mutations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::{ClinicResult, MiddlewareContext, Operation};
use serde::Serialize;
use serde_json::Value;

use crate::chain::{Middleware, MiddlewareRole, Next};
use crate::side_effect::best_effort;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AuditOutcome {
    Success,
    Failure { error: String },
}

/// One completed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub table: String,
    pub operation: Operation,
    pub user_id: Option<String>,
    pub outcome: AuditOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Destination of audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> ClinicResult<()>;
}

/// Writes audit records to the `clinic_audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> ClinicResult<()> {
        match &record.outcome {
            AuditOutcome::Success => tracing::info!(
                target: "clinic_audit",
                table = %record.table,
                operation = %record.operation,
                user_id = ?record.user_id,
                "Mutation succeeded"
            ),
            AuditOutcome::Failure { error } => tracing::info!(
                target: "clinic_audit",
                table = %record.table,
                operation = %record.operation,
                user_id = ?record.user_id,
                error = %error,
                "Mutation failed"
            ),
        }
        Ok(())
    }
}

/// Records the outcome of every mutation after it completes.
pub struct AuditMiddleware {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl AuditMiddleware {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }
}

#[async_trait]
impl Middleware for AuditMiddleware {
    fn role(&self) -> MiddlewareRole {
        MiddlewareRole::Audit
    }

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value> {
        if !ctx.operation.is_mutation() {
            return next.run().await;
        }

        let result = next.run().await;
        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::Failure {
                error: e.to_string(),
            },
        };
        let record = AuditRecord {
            table: ctx.table_name.clone(),
            operation: ctx.operation,
            user_id: ctx.user_id.clone(),
            outcome,
            recorded_at: Utc::now(),
        };
        best_effort("audit record", self.timeout, self.sink.record(record)).await;

        result
    }
}
