//! Session authentication.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::{AuthError, ClinicResult, MiddlewareContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::chain::{Middleware, MiddlewareRole, Next};

/// The caller's authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Absent for sessions that do not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Source of the current session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_current_session(&self) -> Option<Session>;
}

/// Rejects calls without a live session.
pub struct AuthMiddleware {
    sessions: Arc<dyn SessionProvider>,
}

impl AuthMiddleware {
    pub fn new(sessions: Arc<dyn SessionProvider>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn role(&self) -> MiddlewareRole {
        MiddlewareRole::Auth
    }

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value> {
        let session = match self.sessions.get_current_session().await {
            Some(session) => session,
            None => {
                debug!(table = %ctx.table_name, operation = %ctx.operation, "Rejected unauthenticated call");
                return Err(AuthError::NotAuthenticated {
                    table: ctx.table_name.clone(),
                    operation: ctx.operation.to_string(),
                }
                .into());
            }
        };

        if session.is_expired(Utc::now()) {
            debug!(user_id = %session.user_id, "Rejected call with expired session");
            return Err(AuthError::SessionExpired {
                user_id: session.user_id,
            }
            .into());
        }

        next.run().await
    }
}
