//! Per-call context threaded through the middleware chain.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Logical tables served by the repository layer.
pub mod tables {
    pub const PATIENTS: &str = "patients";
    pub const APPOINTMENTS: &str = "appointments";
    pub const CLINICS: &str = "clinics";
}

/// Repository operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindAll,
    FindById,
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Wire name used in cache keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FindAll => "findAll",
            Operation::FindById => "findById",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::FindAll | Operation::FindById)
    }

    pub fn is_mutation(&self) -> bool {
        !self.is_read()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a cache key following the `"{table}:{operation}:{JSON(metadata)}"` convention.
///
/// Absent metadata serializes as `{}`. Object keys are emitted sorted, so two
/// logically identical requests always produce the same key.
pub fn cache_key(table: &str, operation: &str, metadata: Option<&Value>) -> String {
    let params = match metadata {
        Some(value) => canonicalize(value).to_string(),
        None => "{}".to_string(),
    };
    format!("{}:{}:{}", table, operation, params)
}

/// Rebuild a JSON value with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Immutable description of one repository call.
///
/// Built once per invocation and passed by reference through every
/// middleware and the terminal operation.
#[derive(Clone, PartialEq)]
pub struct MiddlewareContext {
    pub table_name: String,
    pub operation: Operation,
    pub user_id: Option<String>,
    pub metadata: Option<Value>,
    pub csrf_token: Option<String>,
}

impl MiddlewareContext {
    pub fn new(table_name: impl Into<String>, operation: Operation) -> Self {
        Self {
            table_name: table_name.into(),
            operation,
            user_id: None,
            metadata: None,
            csrf_token: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    /// Cache key for this call.
    pub fn cache_key(&self) -> String {
        cache_key(
            &self.table_name,
            self.operation.as_str(),
            self.metadata.as_ref(),
        )
    }
}

impl fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("table_name", &self.table_name)
            .field("operation", &self.operation)
            .field("user_id", &self.user_id)
            .field("metadata", &self.metadata)
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_without_metadata() {
        assert_eq!(cache_key("patients", "findAll", None), "patients:findAll:{}");
    }

    #[test]
    fn test_cache_key_with_metadata() {
        let ctx = MiddlewareContext::new(tables::APPOINTMENTS, Operation::FindById)
            .with_metadata(json!({"id": "a-1"}));
        assert_eq!(ctx.cache_key(), r#"appointments:findById:{"id":"a-1"}"#);
    }

    #[test]
    fn test_operation_classification() {
        assert!(Operation::FindAll.is_read());
        assert!(Operation::FindById.is_read());
        assert!(Operation::Create.is_mutation());
        assert!(Operation::Update.is_mutation());
        assert!(Operation::Delete.is_mutation());
        assert_eq!(Operation::FindById.to_string(), "findById");
    }

    #[test]
    fn test_debug_redacts_csrf_token() {
        let ctx = MiddlewareContext::new(tables::CLINICS, Operation::Create)
            .with_csrf_token("super-secret-token");
        let rendered = format!("{:?}", ctx);
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Key construction does not depend on the order fields were inserted.
        #[test]
        fn prop_cache_key_is_insertion_order_independent(
            a in "[a-z]{1,8}",
            b in "[a-z]{1,8}",
            va in any::<i64>(),
            vb in any::<i64>(),
        ) {
            prop_assume!(a != b);
            let mut first = serde_json::Map::new();
            first.insert(a.clone(), json!(va));
            first.insert(b.clone(), json!(vb));
            let mut second = serde_json::Map::new();
            second.insert(b, json!(vb));
            second.insert(a, json!(va));

            let k1 = cache_key("patients", "findAll", Some(&Value::Object(first)));
            let k2 = cache_key("patients", "findAll", Some(&Value::Object(second)));
            prop_assert_eq!(k1, k2);
        }
    }
}
