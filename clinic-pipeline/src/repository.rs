//! Repository facade.
//!
//! [`RepositoryPipeline`] wraps every [`DataSource`] call in the middleware
//! chain. Per call it builds the [`MiddlewareContext`], selects the active
//! roles from [`CallOptions`], runs the chain, decodes the result and
//! substitutes the caller's default when the chain yields `null`.

use std::sync::Arc;

use clinic_core::{ClinicResult, MiddlewareContext, Operation, PipelineConfig, StorageError};
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::chain::{ActiveRoles, MiddlewareChain};
use crate::data_source::DataSource;
use crate::middleware::ResponseCache;
use crate::query::Query;
use crate::side_effect::best_effort;

/// Per-call switches. Unset flags fall back to the operation's defaults:
/// reads run auth, rate limiting and caching; mutations run auth, rate
/// limiting, CSRF and audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub require_auth: Option<bool>,
    pub check_rate_limit: Option<bool>,
    pub require_csrf: Option<bool>,
    pub use_cache: Option<bool>,
    pub audit: Option<bool>,
    pub user_id: Option<String>,
    pub csrf_token: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_auth(mut self, on: bool) -> Self {
        self.require_auth = Some(on);
        self
    }

    pub fn check_rate_limit(mut self, on: bool) -> Self {
        self.check_rate_limit = Some(on);
        self
    }

    pub fn require_csrf(mut self, on: bool) -> Self {
        self.require_csrf = Some(on);
        self
    }

    pub fn use_cache(mut self, on: bool) -> Self {
        self.use_cache = Some(on);
        self
    }

    pub fn audit(mut self, on: bool) -> Self {
        self.audit = Some(on);
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    /// Resolve the roles that run for `operation`.
    pub fn active_roles(&self, operation: Operation) -> ActiveRoles {
        let read = operation.is_read();
        ActiveRoles {
            auth: self.require_auth.unwrap_or(true),
            rate_limit: self.check_rate_limit.unwrap_or(true),
            csrf: self.require_csrf.unwrap_or(!read),
            cache: self.use_cache.unwrap_or(read),
            audit: self.audit.unwrap_or(!read),
        }
    }
}

/// Middleware-wrapped access to a [`DataSource`].
pub struct RepositoryPipeline {
    source: Arc<dyn DataSource>,
    chain: MiddlewareChain,
    cache: Option<Arc<dyn ResponseCache>>,
    config: PipelineConfig,
}

impl RepositoryPipeline {
    pub fn new(
        source: Arc<dyn DataSource>,
        chain: MiddlewareChain,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            chain,
            cache: None,
            config,
        }
    }

    /// Invalidate the table tag in `cache` after every successful mutation.
    pub fn with_cache_invalidation(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// All rows of `table` matching `query`. `null` reads as no rows.
    pub async fn find_all<T>(
        &self,
        table: &str,
        query: &Query,
        options: CallOptions,
    ) -> ClinicResult<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let source = Arc::clone(&self.source);
        let owned_table = table.to_string();
        let owned_query = query.clone();
        self.execute_or(
            table,
            Operation::FindAll,
            Some(query.to_metadata()),
            options,
            Vec::new(),
            move || async move { source.find_all(&owned_table, &owned_query).await }.boxed(),
        )
        .await
    }

    /// The row of `table` with `id`, if any.
    pub async fn find_by_id<T>(
        &self,
        table: &str,
        id: &str,
        options: CallOptions,
    ) -> ClinicResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let source = Arc::clone(&self.source);
        let owned_table = table.to_string();
        let owned_id = id.to_string();
        self.execute_or(
            table,
            Operation::FindById,
            Some(json!({ "id": id })),
            options,
            None,
            move || async move { source.find_by_id(&owned_table, &owned_id).await }.boxed(),
        )
        .await
    }

    /// Insert `record`. A `null` result echoes the submitted record.
    pub async fn create<T>(&self, table: &str, record: T, options: CallOptions) -> ClinicResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let payload = encode(table, &record)?;
        let source = Arc::clone(&self.source);
        let owned_table = table.to_string();
        self.execute_or(
            table,
            Operation::Create,
            None,
            options,
            record,
            move || async move { source.create(&owned_table, payload).await }.boxed(),
        )
        .await
    }

    /// Apply `patch` to the row with `id`. A `null` result echoes the patch.
    pub async fn update<T>(
        &self,
        table: &str,
        id: &str,
        patch: T,
        options: CallOptions,
    ) -> ClinicResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let payload = encode(table, &patch)?;
        let source = Arc::clone(&self.source);
        let owned_table = table.to_string();
        let owned_id = id.to_string();
        self.execute_or(
            table,
            Operation::Update,
            Some(json!({ "id": id })),
            options,
            patch,
            move || async move { source.update(&owned_table, &owned_id, payload).await }.boxed(),
        )
        .await
    }

    /// Remove the row with `id`.
    pub async fn delete(&self, table: &str, id: &str, options: CallOptions) -> ClinicResult<()> {
        let source = Arc::clone(&self.source);
        let owned_table = table.to_string();
        let owned_id = id.to_string();
        // Whatever the source returns for a delete is discarded.
        self.execute_or(
            table,
            Operation::Delete,
            Some(json!({ "id": id })),
            options,
            Value::Null,
            move || async move { source.delete(&owned_table, &owned_id).await }.boxed(),
        )
        .await
        .map(|_: Value| ())
    }

    /// Run a custom operation through the chain.
    ///
    /// `default` is returned when the chain yields `null`; otherwise the
    /// value is decoded into `T`. Mutations the chain completes invalidate
    /// the table's cache tag before decoding, so a decode failure still
    /// leaves later reads fresh.
    pub async fn execute_or<T, F>(
        &self,
        table: &str,
        operation: Operation,
        metadata: Option<Value>,
        options: CallOptions,
        default: T,
        terminal: F,
    ) -> ClinicResult<T>
    where
        T: DeserializeOwned + Send,
        F: FnOnce() -> BoxFuture<'static, ClinicResult<Value>> + Send + 'static,
    {
        let active = options.active_roles(operation);
        let mut ctx = MiddlewareContext::new(table, operation);
        ctx.user_id = options.user_id;
        ctx.metadata = metadata;
        ctx.csrf_token = options.csrf_token;

        let value = self
            .chain
            .execute(&ctx, &active, move || terminal())
            .await?;

        // The write is committed once the chain succeeds, decodable or not.
        if operation.is_mutation() {
            self.invalidate_table(table).await;
        }

        if value.is_null() {
            return Ok(default);
        }
        serde_json::from_value(value).map_err(|e| {
            StorageError::Decode {
                table: table.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn invalidate_table(&self, table: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Some(removed) = best_effort(
            "cache invalidation",
            self.config.side_effect_timeout,
            cache.invalidate_tag(table),
        )
        .await
        {
            debug!(table, removed, "Invalidated cached reads after mutation");
        }
    }
}

fn encode<T: Serialize>(table: &str, value: &T) -> ClinicResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        StorageError::Decode {
            table: table.to_string(),
            reason: format!("cannot encode record: {}", e),
        }
        .into()
    })
}
