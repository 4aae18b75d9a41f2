//! Built-in middlewares and the collaborator traits they depend on.
//!
//! | Middleware | Role | Applies to |
//! |---|---|---|
//! | [`AuthMiddleware`] | `Auth` | every operation |
//! | [`RateLimitMiddleware`] | `RateLimit` | every operation |
//! | [`CsrfMiddleware`] | `Csrf` | mutations |
//! | [`CacheMiddleware`] | `Cache` | reads |
//! | [`AuditMiddleware`] | `Audit` | mutations |

mod audit;
mod auth;
mod cache;
mod csrf;
mod rate_limit;

pub use audit::{AuditMiddleware, AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
pub use auth::{AuthMiddleware, Session, SessionProvider};
pub use cache::{CacheMiddleware, ResponseCache};
pub use csrf::{CsrfMiddleware, CsrfTokenProvider, SessionCsrfTokens};
pub use rate_limit::{GovernorRateLimiter, RateLimitDecision, RateLimitMiddleware, RateLimiter};
