//! Per-user rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinic_core::{ClinicError, ClinicResult, MiddlewareContext, PipelineConfig};
use dashmap::DashMap;
use governor::clock::{Clock as _, DefaultClock};
use governor::{Quota, RateLimiter as GovernorLimiter};
use serde_json::Value;
use tracing::debug;

use super::auth::SessionProvider;
use crate::chain::{Middleware, MiddlewareRole, Next};

/// Identity used when neither the call nor the session names a user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Answer of a [`RateLimiter`] for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Request budget keyed by user.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one request from `user_id`'s budget.
    async fn check(&self, user_id: &str) -> RateLimitDecision;

    async fn can_make_request(&self, user_id: &str) -> bool {
        matches!(self.check(user_id).await, RateLimitDecision::Allowed)
    }
}

type DirectRateLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    DefaultClock,
>;

/// GCRA limiter per user, created on first use.
pub struct GovernorRateLimiter {
    enabled: bool,
    quota: Quota,
    /// Per-user limiters; DashMap gives lock-free concurrent access.
    limiters: DashMap<String, Arc<DirectRateLimiter>>,
}

impl GovernorRateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            enabled: true,
            quota,
            limiters: DashMap::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut limiter = Self::new(config.rate_limit_per_minute, config.rate_limit_burst);
        limiter.enabled = config.rate_limit_enabled;
        limiter
    }

    /// Number of users with a live limiter.
    pub fn tracked_users(&self) -> usize {
        self.limiters.len()
    }

    fn limiter_for(&self, user_id: &str) -> Arc<DirectRateLimiter> {
        if let Some(existing) = self.limiters.get(user_id) {
            return Arc::clone(existing.value());
        }
        self.limiters
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(GovernorLimiter::direct(self.quota)))
            .clone()
    }
}

#[async_trait]
impl RateLimiter for GovernorRateLimiter {
    async fn check(&self, user_id: &str) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::Allowed;
        }
        match self.limiter_for(user_id).check() {
            Ok(()) => RateLimitDecision::Allowed,
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                RateLimitDecision::Limited {
                    // Whole seconds, minimum 1.
                    retry_after: Duration::from_secs(wait.as_secs().max(1)),
                }
            }
        }
    }
}

/// Rejects calls once the user's budget is spent.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            sessions: None,
        }
    }

    /// Fall back to the session user when the call carries no user id.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    async fn resolve_user(&self, ctx: &MiddlewareContext) -> String {
        if let Some(user_id) = &ctx.user_id {
            return user_id.clone();
        }
        if let Some(sessions) = &self.sessions {
            if let Some(session) = sessions.get_current_session().await {
                return session.user_id;
            }
        }
        ANONYMOUS_USER.to_string()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn role(&self) -> MiddlewareRole {
        MiddlewareRole::RateLimit
    }

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value> {
        let user_id = self.resolve_user(ctx).await;
        match self.limiter.check(&user_id).await {
            RateLimitDecision::Allowed => next.run().await,
            RateLimitDecision::Limited { retry_after } => {
                debug!(
                    user_id = %user_id,
                    retry_after_secs = retry_after.as_secs(),
                    table = %ctx.table_name,
                    "Rate limited"
                );
                Err(ClinicError::RateLimited {
                    user_id,
                    retry_after,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_limited() {
        let limiter = GovernorRateLimiter::new(1, 2);
        assert!(limiter.can_make_request("u-1").await);
        assert!(limiter.can_make_request("u-1").await);

        match limiter.check("u-1").await {
            RateLimitDecision::Limited { retry_after } => {
                assert!(retry_after >= Duration::from_secs(1));
            }
            RateLimitDecision::Allowed => panic!("third request should be limited"),
        }
    }

    #[tokio::test]
    async fn test_users_have_separate_budgets() {
        let limiter = GovernorRateLimiter::new(1, 1);
        assert!(limiter.can_make_request("u-1").await);
        assert!(!limiter.can_make_request("u-1").await);
        assert!(limiter.can_make_request("u-2").await);
        assert_eq!(limiter.tracked_users(), 2);
    }

    #[tokio::test]
    async fn test_disabled_limiter_always_allows() {
        let config = PipelineConfig {
            rate_limit_enabled: false,
            ..PipelineConfig::default()
        }
        .with_rate_limit(1, 1);
        let limiter = GovernorRateLimiter::from_config(&config);
        for _ in 0..10 {
            assert!(limiter.can_make_request("u-1").await);
        }
    }
}
