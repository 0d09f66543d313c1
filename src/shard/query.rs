// Minimal predicate evaluation for the operation paths this layer owns.
// The full query language lives in the query engine; routing and the
// migration write paths only need field equality, scalar range operators,
// and `$set`/replacement updates.

use serde_json::Value;

use crate::error::{Result, ShardError};

/// Whether `doc` satisfies `filter`: every filter field must match by
/// equality, or by every operator in an operator document (`$gt`, `$gte`,
/// `$lt`, `$lte`, `$ne`).
pub fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return false;
    };
    conditions.iter().all(|(path, condition)| {
        let field = lookup(doc, path);
        match condition.as_object() {
            Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, bound)| {
                    let Some(field) = field else {
                        return op == "$ne";
                    };
                    match op.as_str() {
                        "$gt" => compare(field, bound).is_some_and(|o| o.is_gt()),
                        "$gte" => compare(field, bound).is_some_and(|o| o.is_ge()),
                        "$lt" => compare(field, bound).is_some_and(|o| o.is_lt()),
                        "$lte" => compare(field, bound).is_some_and(|o| o.is_le()),
                        "$ne" => field != bound,
                        _ => false,
                    }
                })
            }
            _ => field == Some(condition),
        }
    })
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// An update payload: `{"$set": {...}}` merges fields into the matched
/// document, anything else replaces it wholesale (keeping `_id`).
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Set(serde_json::Map<String, Value>),
    Replace(Value),
}

impl UpdateSpec {
    pub fn parse(update: &Value) -> Result<Self> {
        let obj = update.as_object().ok_or_else(|| {
            ShardError::InvalidInput("update must be an object".to_string())
        })?;
        if let Some(set) = obj.get("$set") {
            let fields = set
                .as_object()
                .ok_or_else(|| ShardError::InvalidInput("$set must be an object".to_string()))?;
            if obj.len() != 1 {
                return Err(ShardError::InvalidInput(
                    "$set cannot be combined with other top-level fields".to_string(),
                ));
            }
            return Ok(UpdateSpec::Set(fields.clone()));
        }
        if obj.keys().any(|k| k.starts_with('$')) {
            return Err(ShardError::InvalidInput(format!(
                "unsupported update operator in {}",
                update
            )));
        }
        Ok(UpdateSpec::Replace(update.clone()))
    }

    /// Fields the update writes, with their new values. For replacement
    /// updates this is every field of the replacement document.
    pub fn written_fields(&self) -> Vec<(String, &Value)> {
        match self {
            UpdateSpec::Set(fields) => {
                fields.iter().map(|(k, v)| (k.clone(), v)).collect()
            }
            UpdateSpec::Replace(doc) => doc
                .as_object()
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v)).collect())
                .unwrap_or_default(),
        }
    }

    /// Produce the post-image of `doc` under this update.
    pub fn apply(&self, doc: &Value) -> Value {
        match self {
            UpdateSpec::Set(fields) => {
                let mut out = doc.clone();
                if let Some(obj) = out.as_object_mut() {
                    for (k, v) in fields {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                out
            }
            UpdateSpec::Replace(replacement) => {
                let mut out = replacement.clone();
                if let (Some(obj), Some(id)) = (out.as_object_mut(), doc.get("_id")) {
                    obj.entry("_id".to_string()).or_insert_with(|| id.clone());
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_match() {
        let doc = json!({"_id": 1, "x": 7, "nested": {"a": "b"}});
        assert!(matches_filter(&doc, &json!({"x": 7})));
        assert!(matches_filter(&doc, &json!({"nested.a": "b"})));
        assert!(!matches_filter(&doc, &json!({"x": 8})));
        assert!(!matches_filter(&doc, &json!({"missing": 1})));
        assert!(matches_filter(&doc, &json!({})));
    }

    #[test]
    fn test_operator_match() {
        let doc = json!({"x": 50});
        assert!(matches_filter(&doc, &json!({"x": {"$gte": 50}})));
        assert!(matches_filter(&doc, &json!({"x": {"$gt": 10, "$lt": 100}})));
        assert!(!matches_filter(&doc, &json!({"x": {"$lt": 50}})));
        assert!(matches_filter(&doc, &json!({"x": {"$ne": 51}})));
    }

    #[test]
    fn test_update_set() {
        let spec = UpdateSpec::parse(&json!({"$set": {"v": 2}})).unwrap();
        let doc = json!({"_id": 1, "x": 7, "v": 1});
        let updated = spec.apply(&doc);
        assert_eq!(updated, json!({"_id": 1, "x": 7, "v": 2}));
    }

    #[test]
    fn test_update_replace_preserves_id() {
        let spec = UpdateSpec::parse(&json!({"x": 7, "v": 9})).unwrap();
        let doc = json!({"_id": 1, "x": 7, "v": 1});
        let updated = spec.apply(&doc);
        assert_eq!(updated, json!({"_id": 1, "x": 7, "v": 9}));
    }

    #[test]
    fn test_update_rejects_mixed_operators() {
        assert!(UpdateSpec::parse(&json!({"$set": {"a": 1}, "b": 2})).is_err());
        assert!(UpdateSpec::parse(&json!({"$inc": {"a": 1}})).is_err());
    }
}
