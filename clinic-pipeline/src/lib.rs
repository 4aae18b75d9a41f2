//! Clinic Pipeline - Repository Middleware
//!
//! Wraps every repository operation (`findAll`, `findById`, `create`,
//! `update`, `delete`) in a chain of cross-cutting middlewares:
//!
//! - **Auth**: requires a live session
//! - **Rate limit**: per-user request budget
//! - **CSRF**: anti-forgery token on mutations
//! - **Cache**: read-through caching tagged by table
//! - **Audit**: records the outcome of mutations
//!
//! Middlewares are selected per call by [`MiddlewareRole`], and every
//! side effect that is not part of the primary result runs through
//! [`best_effort`] so it can never fail the caller.
//!
//! # Example
//!
//! ```ignore
//! let chain = MiddlewareChain::new()
//!     .with(AuthMiddleware::new(sessions.clone()))
//!     .with(RateLimitMiddleware::new(limiter).with_sessions(sessions))
//!     .with(CsrfMiddleware::new(tokens))
//!     .with(CacheMiddleware::new(cache.clone(), &config))
//!     .with(AuditMiddleware::new(Arc::new(TracingAuditSink), config.side_effect_timeout));
//!
//! let repo = RepositoryPipeline::new(source, chain, config).with_cache_invalidation(cache);
//! let patients: Vec<Patient> = repo
//!     .find_all(tables::PATIENTS, &Query::new(), CallOptions::new())
//!     .await?;
//! ```

pub mod chain;
pub mod data_source;
pub mod middleware;
pub mod query;
pub mod repository;
pub mod side_effect;
pub mod telemetry;

pub use chain::{ActiveRoles, Middleware, MiddlewareChain, MiddlewareRole, Next, Terminal};
pub use data_source::DataSource;
pub use middleware::{
    AuditMiddleware, AuditOutcome, AuditRecord, AuditSink, AuthMiddleware, CacheMiddleware,
    CsrfMiddleware, CsrfTokenProvider, GovernorRateLimiter, RateLimitDecision,
    RateLimitMiddleware, RateLimiter, ResponseCache, Session, SessionCsrfTokens,
    SessionProvider, TracingAuditSink,
};
pub use query::{OrderBy, Query, SortDirection};
pub use repository::{CallOptions, RepositoryPipeline};
pub use side_effect::best_effort;
pub use telemetry::{init_tracing, TelemetryConfig};
