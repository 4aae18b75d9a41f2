//! Persistence collaborator behind the repository.

use async_trait::async_trait;
use clinic_core::ClinicResult;
use serde_json::Value;

use crate::query::Query;

/// The external data store. Implementations translate calls into their
/// own query language.
///
/// A `null` result means "nothing"; the repository substitutes the caller's
/// default for it.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn find_all(&self, table: &str, query: &Query) -> ClinicResult<Value>;

    async fn find_by_id(&self, table: &str, id: &str) -> ClinicResult<Value>;

    async fn create(&self, table: &str, record: Value) -> ClinicResult<Value>;

    async fn update(&self, table: &str, id: &str, patch: Value) -> ClinicResult<Value>;

    async fn delete(&self, table: &str, id: &str) -> ClinicResult<Value>;
}
