//! Chain-of-responsibility core.
//!
//! A [`MiddlewareChain`] holds an ordered list of [`Middleware`]s. For each
//! call the caller picks the active roles; inactive middlewares are skipped
//! entirely and the remaining ones wrap the terminal operation so that the
//! first middleware in the list is the outermost.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clinic_core::{ClinicResult, MiddlewareContext};
use futures_util::future::BoxFuture;
use serde_json::Value;

/// What a middleware does, used to switch it on or off per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareRole {
    Auth,
    RateLimit,
    Csrf,
    Cache,
    Audit,
    /// Application-specific middleware; always active.
    Custom(&'static str),
}

impl MiddlewareRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareRole::Auth => "auth",
            MiddlewareRole::RateLimit => "rate_limit",
            MiddlewareRole::Csrf => "csrf",
            MiddlewareRole::Cache => "cache",
            MiddlewareRole::Audit => "audit",
            MiddlewareRole::Custom(name) => *name,
        }
    }
}

impl fmt::Display for MiddlewareRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call selection of built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRoles {
    pub auth: bool,
    pub rate_limit: bool,
    pub csrf: bool,
    pub cache: bool,
    pub audit: bool,
}

impl ActiveRoles {
    pub fn all() -> Self {
        Self {
            auth: true,
            rate_limit: true,
            csrf: true,
            cache: true,
            audit: true,
        }
    }

    /// Only custom middlewares run.
    pub fn none() -> Self {
        Self {
            auth: false,
            rate_limit: false,
            csrf: false,
            cache: false,
            audit: false,
        }
    }

    pub fn is_active(&self, role: MiddlewareRole) -> bool {
        match role {
            MiddlewareRole::Auth => self.auth,
            MiddlewareRole::RateLimit => self.rate_limit,
            MiddlewareRole::Csrf => self.csrf,
            MiddlewareRole::Cache => self.cache,
            MiddlewareRole::Audit => self.audit,
            MiddlewareRole::Custom(_) => true,
        }
    }
}

/// The innermost operation of a call.
pub type Terminal<'a> = Box<dyn FnOnce() -> BoxFuture<'a, ClinicResult<Value>> + Send + 'a>;

/// Cross-cutting step wrapped around a repository operation.
///
/// Implementations either short-circuit with a value or error, or call
/// [`Next::run`] exactly once and may act on its result.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn role(&self) -> MiddlewareRole;

    async fn execute(&self, next: Next<'_>, ctx: &MiddlewareContext) -> ClinicResult<Value>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    remaining: std::vec::IntoIter<Arc<dyn Middleware>>,
    ctx: &'a MiddlewareContext,
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    /// Run the remaining middlewares and then the terminal operation.
    pub fn run(mut self) -> BoxFuture<'a, ClinicResult<Value>> {
        match self.remaining.next() {
            Some(middleware) => Box::pin(async move {
                let ctx = self.ctx;
                middleware.execute(self, ctx).await
            }),
            None => (self.terminal)(),
        }
    }

    /// Number of middlewares still ahead of the terminal operation.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// Ordered list of middlewares.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs inside every middleware added before it.
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn roles(&self) -> Vec<MiddlewareRole> {
        self.middlewares.iter().map(|m| m.role()).collect()
    }

    /// Run `terminal` wrapped by every middleware whose role is active.
    ///
    /// Errors from any step propagate unchanged.
    pub async fn execute<'a, F>(
        &self,
        ctx: &'a MiddlewareContext,
        active: &ActiveRoles,
        terminal: F,
    ) -> ClinicResult<Value>
    where
        F: FnOnce() -> BoxFuture<'a, ClinicResult<Value>> + Send + 'a,
    {
        let selected: Vec<Arc<dyn Middleware>> = self
            .middlewares
            .iter()
            .filter(|m| active.is_active(m.role()))
            .cloned()
            .collect();

        tracing::trace!(
            table = %ctx.table_name,
            operation = %ctx.operation,
            active = selected.len(),
            configured = self.middlewares.len(),
            "Running middleware chain"
        );

        let next = Next {
            remaining: selected.into_iter(),
            ctx,
            terminal: Box::new(terminal),
        };
        next.run().await
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("roles", &self.roles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::{ClinicError, Operation, StorageError};
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        role: MiddlewareRole,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn role(&self) -> MiddlewareRole {
            self.role
        }

        async fn execute(&self, next: Next<'_>, _ctx: &MiddlewareContext) -> ClinicResult<Value> {
            self.log.lock().expect("log").push(format!("enter {}", self.role));
            let result = next.run().await;
            self.log.lock().expect("log").push(format!("exit {}", self.role));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn role(&self) -> MiddlewareRole {
            MiddlewareRole::Cache
        }

        async fn execute(&self, _next: Next<'_>, _ctx: &MiddlewareContext) -> ClinicResult<Value> {
            Ok(json!("from-short-circuit"))
        }
    }

    fn recorder(role: MiddlewareRole, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            role,
            log: Arc::clone(log),
        }
    }

    #[tokio::test]
    async fn test_first_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(recorder(MiddlewareRole::Auth, &log))
            .with(recorder(MiddlewareRole::RateLimit, &log));
        let ctx = MiddlewareContext::new("patients", Operation::FindAll);

        let terminal_log = Arc::clone(&log);
        let result = chain
            .execute(&ctx, &ActiveRoles::all(), move || {
                async move {
                    terminal_log.lock().expect("log").push("terminal".to_string());
                    Ok(json!([]))
                }
                .boxed()
            })
            .await;

        assert_eq!(result, Ok(json!([])));
        assert_eq!(
            *log.lock().expect("log"),
            vec![
                "enter auth",
                "enter rate_limit",
                "terminal",
                "exit rate_limit",
                "exit auth"
            ]
        );
    }

    #[tokio::test]
    async fn test_inactive_roles_are_skipped_and_custom_always_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(recorder(MiddlewareRole::Auth, &log))
            .with(recorder(MiddlewareRole::Custom("trace"), &log))
            .with(recorder(MiddlewareRole::Cache, &log));
        let ctx = MiddlewareContext::new("patients", Operation::Create);

        chain
            .execute(&ctx, &ActiveRoles::none(), || async { Ok(Value::Null) }.boxed())
            .await
            .expect("chain should succeed");

        assert_eq!(*log.lock().expect("log"), vec!["enter trace", "exit trace"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let chain = MiddlewareChain::new().with(ShortCircuit);
        let ctx = MiddlewareContext::new("clinics", Operation::FindById);

        let result = chain
            .execute(&ctx, &ActiveRoles::all(), || panic!("terminal must not run"))
            .await;
        assert_eq!(result, Ok(json!("from-short-circuit")));
    }

    #[tokio::test]
    async fn test_terminal_error_propagates_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new().with(recorder(MiddlewareRole::Auth, &log));
        let ctx = MiddlewareContext::new("appointments", Operation::Delete);
        let expected = ClinicError::Storage(StorageError::NotFound {
            table: "appointments".to_string(),
            id: "a-9".to_string(),
        });

        let err = expected.clone();
        let result = chain
            .execute(&ctx, &ActiveRoles::all(), move || async move { Err(err) }.boxed())
            .await;
        assert_eq!(result, Err(expected));
    }

    #[test]
    fn test_active_roles() {
        let roles = ActiveRoles {
            csrf: false,
            ..ActiveRoles::all()
        };
        assert!(roles.is_active(MiddlewareRole::Auth));
        assert!(!roles.is_active(MiddlewareRole::Csrf));
        assert!(ActiveRoles::none().is_active(MiddlewareRole::Custom("x")));
    }
}
