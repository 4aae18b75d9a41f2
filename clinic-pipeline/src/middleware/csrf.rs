//! Anti-forgery token checks for mutations.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use clinic_core::{ClinicResult, CsrfError, MiddlewareContext};
use serde_json::Value;
use tracing::debug;

use crate::chain::{Middleware, MiddlewareRole, Next};

/// Length of issued tokens in bytes, before hex encoding.
const TOKEN_BYTES: usize = 32;

/// Source and validator of CSRF tokens.
#[async_trait]
pub trait CsrfTokenProvider: Send + Sync {
    /// Token of the current session, used when the call supplies none.
    async fn get_token(&self) -> Option<String>;

    fn validate_token(&self, token: &str) -> bool {
        !token.trim().is_empty()
    }
}

/// Issues one random token per session and validates against it.
#[derive(Debug, Default)]
pub struct SessionCsrfTokens {
    current: RwLock<Option<String>>,
}

impl SessionCsrfTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token, replacing any previous one.
    pub fn issue(&self) -> String {
        let token = hex::encode(rand::random::<[u8; TOKEN_BYTES]>());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    /// Forget the current token; every later check fails until `issue`.
    pub fn revoke(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn current(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CsrfTokenProvider for SessionCsrfTokens {
    async fn get_token(&self) -> Option<String> {
        self.current()
    }

    fn validate_token(&self, token: &str) -> bool {
        match self.current() {
            Some(expected) => constant_time_eq(expected.as_bytes(), token.as_bytes()),
            None => false,
        }
    }
}

/// Compare without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Requires a valid token on every mutation. Reads pass straight through.
pub struct CsrfMiddleware {
    tokens: Arc<dyn CsrfTokenProvider>,
}

impl CsrfMiddleware {
    pub fn new(tokens: Arc<dyn CsrfTokenProvider>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Middleware for CsrfMiddleware {
    fn role(&self) -> MiddlewareRole {
        MiddlewareRole::Csrf
    }

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value> {
        if ctx.operation.is_read() {
            return next.run().await;
        }

        let token = match &ctx.csrf_token {
            Some(token) => Some(token.clone()),
            None => self.tokens.get_token().await,
        };

        let Some(token) = token else {
            debug!(table = %ctx.table_name, operation = %ctx.operation, "CSRF token missing");
            return Err(CsrfError::Missing {
                table: ctx.table_name.clone(),
                operation: ctx.operation.to_string(),
            }
            .into());
        };

        if !self.tokens.validate_token(&token) {
            debug!(table = %ctx.table_name, operation = %ctx.operation, "CSRF token rejected");
            return Err(CsrfError::Invalid {
                table: ctx.table_name.clone(),
                operation: ctx.operation.to_string(),
            }
            .into());
        }

        next.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issued_token_validates() {
        let tokens = SessionCsrfTokens::new();
        assert_eq!(tokens.get_token().await, None);
        assert!(!tokens.validate_token("anything"));

        let token = tokens.issue();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(tokens.validate_token(&token));
        assert!(!tokens.validate_token(&token[1..]));
        assert_eq!(tokens.get_token().await, Some(token.clone()));

        let rotated = tokens.issue();
        assert_ne!(rotated, token);
        assert!(!tokens.validate_token(&token));

        tokens.revoke();
        assert!(!tokens.validate_token(&rotated));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
