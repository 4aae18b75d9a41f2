//! Immutable query builder for `find_all`.
//!
//! Every builder step consumes the query and returns a new one, so a query
//! value is always complete and valid. Equality filters are keyed by field,
//! which keeps the serialized form (and therefore the cache key) independent
//! of the order filters were added in.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Filter, ordering and paging for a table scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    eq: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`. A later filter on the same field replaces
    /// the earlier one.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn filters(&self) -> &BTreeMap<String, Value> {
        &self.eq
    }

    pub fn ordering(&self) -> Option<&OrderBy> {
        self.order_by.as_ref()
    }

    pub fn limit_count(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset_count(&self) -> Option<usize> {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Serialized form used as cache-key metadata. An empty query is `{}`.
    pub fn to_metadata(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Whether `record` satisfies every equality filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.eq
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// Filter, order and page `rows` in memory.
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).collect();

        if let Some(order) = &self.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_json(a.get(&order.field), b.get(&order.field));
                match order.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            });
        }

        let skip = self.offset.unwrap_or(0);
        let take = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }
}

/// Total order over optional JSON scalars: missing < null < bool < number < string.
fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::cache_key;
    use serde_json::json;

    #[test]
    fn test_empty_query_metadata_matches_absent_metadata() {
        let query = Query::new();
        assert!(query.is_empty());
        assert_eq!(
            cache_key("patients", "findAll", Some(&query.to_metadata())),
            cache_key("patients", "findAll", None)
        );
    }

    #[test]
    fn test_builder_steps_do_not_mutate_earlier_values() {
        let base = Query::new().eq("clinicId", "c-1");
        let paged = base.clone().limit(10).offset(20);

        assert_eq!(base.limit_count(), None);
        assert_eq!(paged.limit_count(), Some(10));
        assert_eq!(paged.offset_count(), Some(20));
        assert_eq!(paged.filters().get("clinicId"), Some(&json!("c-1")));
    }

    #[test]
    fn test_filter_order_does_not_change_key() {
        let a = Query::new().eq("status", "booked").eq("clinicId", "c-1");
        let b = Query::new().eq("clinicId", "c-1").eq("status", "booked");
        assert_eq!(
            cache_key("appointments", "findAll", Some(&a.to_metadata())),
            cache_key("appointments", "findAll", Some(&b.to_metadata()))
        );
    }

    #[test]
    fn test_apply_filters_orders_and_pages() {
        let rows = vec![
            json!({"id": "a1", "clinicId": "c-1", "start": 3}),
            json!({"id": "a2", "clinicId": "c-2", "start": 1}),
            json!({"id": "a3", "clinicId": "c-1", "start": 1}),
            json!({"id": "a4", "clinicId": "c-1", "start": 2}),
        ];
        let query = Query::new()
            .eq("clinicId", "c-1")
            .order_by("start", SortDirection::Desc)
            .offset(1)
            .limit(1);

        assert_eq!(query.apply(rows), vec![json!({"id": "a4", "clinicId": "c-1", "start": 2})]);
    }

    #[test]
    fn test_serialized_shape() {
        let query = Query::new()
            .eq("id", "p-1")
            .order_by("name", SortDirection::Asc)
            .limit(5);
        assert_eq!(
            query.to_metadata(),
            json!({
                "eq": {"id": "p-1"},
                "orderBy": {"field": "name", "direction": "asc"},
                "limit": 5
            })
        );
    }
}
