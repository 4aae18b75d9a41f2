//! Read-through response caching.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinic_cache::CacheStore;
use clinic_core::{CacheResult, ClinicResult, MiddlewareContext, PipelineConfig};
use serde_json::Value;
use tracing::debug;

use crate::chain::{Middleware, MiddlewareRole, Next};
use crate::side_effect::best_effort;

/// Cache operations the pipeline needs.
///
/// Implemented for [`CacheStore`]; tests substitute failing or slow caches.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn store(&self, key: &str, value: Value, tags: &[&str], ttl: Duration)
        -> CacheResult<()>;

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize>;
}

#[async_trait]
impl ResponseCache for CacheStore {
    async fn lookup(&self, key: &str) -> CacheResult<Option<Value>> {
        self.get(key).await
    }

    async fn store(
        &self,
        key: &str,
        value: Value,
        tags: &[&str],
        ttl: Duration,
    ) -> CacheResult<()> {
        self.set_with_tags(key, value, tags, Some(ttl)).await
    }

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        self.invalidate_by_tag(tag).await
    }
}

/// Serves reads from the cache and writes misses back, tagged by table.
///
/// Cache failures never reach the caller: a failed or slow lookup is a
/// miss, and write-back is best-effort.
pub struct CacheMiddleware {
    cache: Arc<dyn ResponseCache>,
    ttl: Duration,
    timeout: Duration,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<dyn ResponseCache>, config: &PipelineConfig) -> Self {
        Self {
            cache,
            ttl: config.read_cache_ttl,
            timeout: config.side_effect_timeout,
        }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn role(&self) -> MiddlewareRole {
        MiddlewareRole::Cache
    }

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value> {
        if !ctx.operation.is_read() {
            return next.run().await;
        }

        let key = ctx.cache_key();
        if let Some(Some(cached)) =
            best_effort("cache read", self.timeout, self.cache.lookup(&key)).await
        {
            debug!(key = %key, "Serving read from cache");
            return Ok(cached);
        }

        let result = next.run().await?;

        if !result.is_null() {
            let tags = [ctx.table_name.as_str()];
            best_effort(
                "cache write-back",
                self.timeout,
                self.cache.store(&key, result.clone(), &tags, self.ttl),
            )
            .await;
        }

        Ok(result)
    }
}
