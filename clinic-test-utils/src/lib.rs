//! Clinic Test Utilities
//!
//! Shared test infrastructure for the clinic workspace:
//! - Mock providers (sessions, rate limits, CSRF tokens, audit sinks)
//! - In-memory and scripted data sources
//! - Instrumented middleware and caches for chain tests
//! - Proptest generators and fixtures

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use clinic_core::{
    CacheError, CacheResult, ClinicError, ClinicResult, MiddlewareContext, StorageError,
};
use clinic_pipeline::{
    AuditRecord, AuditSink, CsrfTokenProvider, DataSource, Middleware, MiddlewareRole, Next,
    Query, RateLimitDecision, RateLimiter, ResponseCache, Session, SessionProvider,
};
use serde_json::Value;
use uuid::Uuid;

pub use clinic_core::ManualClock;

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// Session provider returning a fixed session, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider {
    session: Option<Session>,
}

impl StaticSessionProvider {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            session: Some(Session::new(user_id)),
        }
    }

    pub fn signed_out() -> Self {
        Self { session: None }
    }

    /// Session for `user_id` that expired an hour ago.
    pub fn expired(user_id: impl Into<String>) -> Self {
        Self {
            session: Some(Session::new(user_id).with_expiry(Utc::now() - ChronoDuration::hours(1))),
        }
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn get_current_session(&self) -> Option<Session> {
        self.session.clone()
    }
}

/// Rate limiter that never limits, counting the users it saw.
#[derive(Debug, Default)]
pub struct AllowAllLimiter {
    seen: Mutex<Vec<String>>,
}

impl AllowAllLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// User ids checked so far, in order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RateLimiter for AllowAllLimiter {
    async fn check(&self, user_id: &str) -> RateLimitDecision {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(user_id.to_string());
        }
        RateLimitDecision::Allowed
    }
}

/// Rate limiter that always limits.
#[derive(Debug, Clone, Copy)]
pub struct DenyAllLimiter {
    pub retry_after: Duration,
}

impl Default for DenyAllLimiter {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl RateLimiter for DenyAllLimiter {
    async fn check(&self, _user_id: &str) -> RateLimitDecision {
        RateLimitDecision::Limited {
            retry_after: self.retry_after,
        }
    }
}

/// CSRF provider with a fixed session token that accepts only that token.
#[derive(Debug, Clone, Default)]
pub struct StaticCsrfTokens {
    token: Option<String>,
}

impl StaticCsrfTokens {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn without_token() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CsrfTokenProvider for StaticCsrfTokens {
    async fn get_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn validate_token(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }
}

/// Audit sink collecting records in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: AuditRecord) -> ClinicResult<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}

// ============================================================================
// MOCK DATA SOURCES
// ============================================================================

/// Per-operation call counters of a mock data source.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub find_all: AtomicUsize,
    pub find_by_id: AtomicUsize,
    pub create: AtomicUsize,
    pub update: AtomicUsize,
    pub delete: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.find_all.load(Ordering::SeqCst)
            + self.find_by_id.load(Ordering::SeqCst)
            + self.create.load(Ordering::SeqCst)
            + self.update.load(Ordering::SeqCst)
            + self.delete.load(Ordering::SeqCst)
    }
}

/// Table store held in memory. Records are JSON objects keyed by `id`.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    pub calls: CallCounts,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record` directly, bypassing the pipeline.
    pub fn seed(&self, table: &str, record: Value) {
        let id = record_id(&record).unwrap_or_else(|| Uuid::now_v7().to_string());
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .entry(table.to_string())
                .or_default()
                .insert(id, record);
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.get(table).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn with_tables<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, BTreeMap<String, Value>>) -> ClinicResult<R>,
    ) -> ClinicResult<R> {
        let mut tables = self.tables.lock().map_err(|_| StorageError::Unavailable {
            reason: "in-memory store poisoned".to_string(),
        })?;
        f(&mut tables)
    }
}

fn record_id(record: &Value) -> Option<String> {
    record.get("id").and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn find_all(&self, table: &str, query: &Query) -> ClinicResult<Value> {
        self.calls.find_all.fetch_add(1, Ordering::SeqCst);
        self.with_tables(|tables| {
            let rows: Vec<Value> = tables
                .get(table)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default();
            Ok(Value::Array(query.apply(rows)))
        })
    }

    async fn find_by_id(&self, table: &str, id: &str) -> ClinicResult<Value> {
        self.calls.find_by_id.fetch_add(1, Ordering::SeqCst);
        self.with_tables(|tables| {
            Ok(tables
                .get(table)
                .and_then(|rows| rows.get(id))
                .cloned()
                .unwrap_or(Value::Null))
        })
    }

    async fn create(&self, table: &str, mut record: Value) -> ClinicResult<Value> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        let id = match record_id(&record) {
            Some(id) => id,
            None => {
                let id = Uuid::now_v7().to_string();
                if let Some(obj) = record.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(id.clone()));
                }
                id
            }
        };
        self.with_tables(|tables| {
            tables
                .entry(table.to_string())
                .or_default()
                .insert(id, record.clone());
            Ok(record)
        })
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> ClinicResult<Value> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        self.with_tables(|tables| {
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.get_mut(id))
                .ok_or_else(|| StorageError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                })?;
            if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
                for (field, value) in changes {
                    target.insert(field.clone(), value.clone());
                }
            }
            Ok(row.clone())
        })
    }

    async fn delete(&self, table: &str, id: &str) -> ClinicResult<Value> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.with_tables(|tables| {
            Ok(tables
                .get_mut(table)
                .and_then(|rows| rows.remove(id))
                .unwrap_or(Value::Null))
        })
    }
}

/// Data source returning one scripted result for every call.
#[derive(Debug)]
pub struct ScriptedDataSource {
    result: ClinicResult<Value>,
    pub calls: CallCounts,
}

impl ScriptedDataSource {
    pub fn returning(value: Value) -> Self {
        Self {
            result: Ok(value),
            calls: CallCounts::default(),
        }
    }

    pub fn failing(error: ClinicError) -> Self {
        Self {
            result: Err(error),
            calls: CallCounts::default(),
        }
    }
}

#[async_trait]
impl DataSource for ScriptedDataSource {
    async fn find_all(&self, _table: &str, _query: &Query) -> ClinicResult<Value> {
        self.calls.find_all.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    async fn find_by_id(&self, _table: &str, _id: &str) -> ClinicResult<Value> {
        self.calls.find_by_id.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    async fn create(&self, _table: &str, _record: Value) -> ClinicResult<Value> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    async fn update(&self, _table: &str, _id: &str, _patch: Value) -> ClinicResult<Value> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    async fn delete(&self, _table: &str, _id: &str) -> ClinicResult<Value> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

// ============================================================================
// INSTRUMENTED MIDDLEWARE AND CACHES
// ============================================================================

/// Pass-through middleware counting its executions.
#[derive(Debug, Clone)]
pub struct CountingMiddleware {
    role: MiddlewareRole,
    calls: Arc<AtomicUsize>,
}

impl CountingMiddleware {
    pub fn new(role: MiddlewareRole) -> Self {
        Self {
            role,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter; stays valid after the middleware is moved into a chain.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Middleware for CountingMiddleware {
    fn role(&self) -> MiddlewareRole {
        self.role
    }

    async fn execute(&self, next: Next<'_>, _ctx: &MiddlewareContext) -> ClinicResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        next.run().await
    }
}

/// Cache whose writes and invalidations always fail.
///
/// Lookups miss by default so the write-back path runs; `failing_lookups`
/// makes them error too. `hanging_writes` makes writes never complete.
#[derive(Debug, Default)]
pub struct FailingCache {
    lookup_fails: bool,
    hang_writes: bool,
    pub lookups: AtomicUsize,
    pub stores: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl FailingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_lookups(mut self) -> Self {
        self.lookup_fails = true;
        self
    }

    pub fn hanging_writes(mut self) -> Self {
        self.hang_writes = true;
        self
    }

    fn unavailable() -> CacheError {
        CacheError::Unavailable {
            reason: "cache offline".to_string(),
        }
    }
}

#[async_trait]
impl ResponseCache for FailingCache {
    async fn lookup(&self, _key: &str) -> CacheResult<Option<Value>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.lookup_fails {
            Err(Self::unavailable())
        } else {
            Ok(None)
        }
    }

    async fn store(
        &self,
        _key: &str,
        _value: Value,
        _tags: &[&str],
        _ttl: Duration,
    ) -> CacheResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.hang_writes {
            std::future::pending::<()>().await;
        }
        Err(Self::unavailable())
    }

    async fn invalidate_tag(&self, _tag: &str) -> CacheResult<usize> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Err(Self::unavailable())
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pipeline inputs.

    use clinic_core::{tables, Operation};
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::fixtures::Patient;

    pub fn arb_table() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just(tables::PATIENTS),
            Just(tables::APPOINTMENTS),
            Just(tables::CLINICS),
        ]
    }

    pub fn arb_operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            Just(Operation::FindAll),
            Just(Operation::FindById),
            Just(Operation::Create),
            Just(Operation::Update),
            Just(Operation::Delete),
        ]
    }

    pub fn arb_read() -> impl Strategy<Value = Operation> {
        prop_oneof![Just(Operation::FindAll), Just(Operation::FindById)]
    }

    pub fn arb_mutation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            Just(Operation::Create),
            Just(Operation::Update),
            Just(Operation::Delete),
        ]
    }

    pub fn arb_record_id() -> impl Strategy<Value = String> {
        "[a-z]{1,3}-[0-9]{1,4}"
    }

    /// Flat metadata object with scalar values.
    pub fn arb_metadata() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-zA-Z]{1,8}", "[a-z0-9 ]{0,12}", 0..4)
            .prop_map(|fields| json!(fields))
    }

    pub fn arb_patient() -> impl Strategy<Value = Patient> {
        (arb_record_id(), "[A-Z][a-z]{1,10}", 0u16..110).prop_map(|(id, name, age)| Patient {
            id,
            name,
            age,
        })
    }

    pub fn arb_user_id() -> impl Strategy<Value = String> {
        "u-[0-9a-f]{4}"
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use std::sync::Arc;

    use clinic_cache::{CacheStore, MemoryMirror};
    use clinic_core::{CacheConfig, ManualClock, PipelineConfig};
    use serde::{Deserialize, Serialize};

    /// Fixed start instant of test clocks.
    pub const TEST_EPOCH_MILLIS: i64 = 1_700_000_000_000;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Patient {
        pub id: String,
        pub name: String,
        pub age: u16,
    }

    pub fn patient(id: &str, name: &str) -> Patient {
        Patient {
            id: id.to_string(),
            name: name.to_string(),
            age: 42,
        }
    }

    pub fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(TEST_EPOCH_MILLIS))
    }

    /// Cache store over an in-memory mirror and `clock`.
    pub fn cache_store(config: CacheConfig, clock: Arc<ManualClock>) -> Arc<CacheStore> {
        let mirror = Arc::new(MemoryMirror::with_quota(config.persistent_budget_bytes));
        match CacheStore::new(config, mirror, clock) {
            Ok(store) => Arc::new(store),
            Err(e) => panic!("test cache config must be valid: {}", e),
        }
    }

    /// Pipeline config with short side-effect timeouts.
    pub fn fast_pipeline_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_side_effect_timeout(std::time::Duration::from_millis(100))
            .with_rate_limit(600, 100)
    }
}
