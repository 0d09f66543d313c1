// # Shard Key Space
//
// Values in shard-key space: the ordered scalar domain a collection is
// partitioned over, the `MinKey`/`MaxKey` sentinels that bound it, and the
// shard-key pattern that extracts a key from a document.
//
// Scalar ordering follows the document model's canonical type order:
// MinKey < Null < numbers < strings < booleans < MaxKey. Numbers compare
// numerically across integer/double representations, with the representation
// itself as a tiebreaker so the total order stays consistent with equality.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, ShardError};

/// A single scalar in shard-key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    /// Sentinel below every real value.
    MinKey,
    Null,
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
    /// Sentinel above every real value.
    MaxKey,
    /// A value in a descending key field, comparing inversely to its inner
    /// value. Produced only by extraction through a descending pattern
    /// field, so it never meets a non-reversed value of the same field.
    Reversed(Box<KeyValue>),
}

impl KeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Int(_) | KeyValue::Double(_) => 2,
            KeyValue::String(_) => 3,
            KeyValue::Bool(_) => 4,
            KeyValue::MaxKey => 5,
            KeyValue::Reversed(_) => 6,
        }
    }

    /// Build from a JSON scalar. Objects, arrays, and non-finite numbers are
    /// not valid shard-key values.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(KeyValue::Null),
            serde_json::Value::Bool(b) => Ok(KeyValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(KeyValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() {
                        Ok(KeyValue::Double(f))
                    } else {
                        Err(ShardError::InvalidInput(
                            "non-finite number is not a valid shard key value".into(),
                        ))
                    }
                } else {
                    Err(ShardError::InvalidInput(format!(
                        "unrepresentable number in shard key: {}",
                        n
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(KeyValue::String(s.clone())),
            other => Err(ShardError::InvalidInput(format!(
                "shard key fields must be scalar, got {}",
                other
            ))),
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use KeyValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            // Cross-representation numeric comparison; representation breaks
            // exact ties so the order agrees with structural equality.
            (Int(a), Double(b)) => (*a as f64)
                .total_cmp(b)
                .then(Ordering::Less),
            (Double(a), Int(b)) => a
                .total_cmp(&(*b as f64))
                .then(Ordering::Greater),
            (String(a), String(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Reversed(a), Reversed(b)) => b.cmp(a),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl std::hash::Hash for KeyValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            KeyValue::MinKey => 0u8.hash(state),
            KeyValue::Null => 1u8.hash(state),
            KeyValue::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            KeyValue::Double(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            KeyValue::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            KeyValue::Bool(b) => {
                5u8.hash(state);
                b.hash(state);
            }
            KeyValue::MaxKey => 6u8.hash(state),
            KeyValue::Reversed(inner) => {
                7u8.hash(state);
                inner.hash(state);
            }
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::Null => write!(f, "null"),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Double(d) => write!(f, "{}", d),
            KeyValue::String(s) => write!(f, "\"{}\"", s),
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::MaxKey => write!(f, "MaxKey"),
            KeyValue::Reversed(inner) => write!(f, "rev({})", inner),
        }
    }
}

/// A concrete point in shard-key space: one scalar per shard-key field,
/// ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<KeyValue>);

impl Key {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// Convenience constructor for single-field keys.
    pub fn single(value: KeyValue) -> Self {
        Self(vec![value])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rough serialized footprint, used for migration memory accounting.
    pub fn approximate_size(&self) -> usize {
        self.0
            .iter()
            .map(|v| match v {
                KeyValue::String(s) => 16 + s.len(),
                KeyValue::Reversed(_) => 32,
                _ => 16,
            })
            .sum()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, " }}")
    }
}

/// Per-field ordering marker of a shard key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDirection {
    Ascending,
    Descending,
    Hashed,
}

/// One field of a shard key: a document field path plus its marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyField {
    pub path: String,
    pub direction: KeyDirection,
}

/// The ordered tuple of fields a collection is partitioned on. Immutable
/// per collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<ShardKeyField>,
}

impl ShardKeyPattern {
    pub fn new(fields: Vec<ShardKeyField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(ShardError::InvalidInput(
                "shard key pattern must have at least one field".into(),
            ));
        }
        Ok(Self { fields })
    }

    /// Single ascending field, the common case.
    pub fn ascending(path: impl Into<String>) -> Self {
        Self {
            fields: vec![ShardKeyField {
                path: path.into(),
                direction: KeyDirection::Ascending,
            }],
        }
    }

    /// Single hashed field.
    pub fn hashed(path: impl Into<String>) -> Self {
        Self {
            fields: vec![ShardKeyField {
                path: path.into(),
                direction: KeyDirection::Hashed,
            }],
        }
    }

    pub fn fields(&self) -> &[ShardKeyField] {
        &self.fields
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn to_key_space(&self, field: &ShardKeyField, raw: KeyValue) -> KeyValue {
        match field.direction {
            KeyDirection::Ascending => raw,
            KeyDirection::Descending => KeyValue::Reversed(Box::new(raw)),
            KeyDirection::Hashed => KeyValue::Int(hash_key_value(&raw)),
        }
    }

    /// Extract the full shard key from a document. Every pattern field must
    /// be present as a scalar; a missing field is `ShardKeyNotFound`.
    pub fn extract(&self, doc: &serde_json::Value) -> Result<Key> {
        let obj = doc.as_object().ok_or_else(|| {
            ShardError::InvalidInput("document must be an object".to_string())
        })?;

        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = lookup_path(obj, &field.path).ok_or_else(|| {
                ShardError::ShardKeyNotFound(format!(
                    "document is missing shard key field '{}'",
                    field.path
                ))
            })?;
            values.push(self.to_key_space(field, KeyValue::from_json(raw)?));
        }
        Ok(Key(values))
    }

    /// Extract the shard key from an equality-only filter, if the filter
    /// pins every key field to a concrete scalar.
    pub fn extract_from_equality(&self, filter: &serde_json::Value) -> Option<Key> {
        let obj = filter.as_object()?;
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = lookup_path(obj, &field.path)?;
            // An operator document ({"$gte": ...}) is not an equality.
            if raw.as_object().is_some() {
                return None;
            }
            values.push(self.to_key_space(field, KeyValue::from_json(raw).ok()?));
        }
        Some(Key(values))
    }

    /// Global minimum of this pattern's key space.
    pub fn global_min(&self) -> Key {
        Key(self
            .fields
            .iter()
            .map(|f| match f.direction {
                KeyDirection::Descending => KeyValue::Reversed(Box::new(KeyValue::MaxKey)),
                _ => KeyValue::MinKey,
            })
            .collect())
    }

    /// Global maximum of this pattern's key space.
    pub fn global_max(&self) -> Key {
        Key(self
            .fields
            .iter()
            .map(|f| match f.direction {
                KeyDirection::Descending => KeyValue::Reversed(Box::new(KeyValue::MinKey)),
                _ => KeyValue::MaxKey,
            })
            .collect())
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let marker = match field.direction {
                KeyDirection::Ascending => "1".to_string(),
                KeyDirection::Descending => "-1".to_string(),
                KeyDirection::Hashed => "\"hashed\"".to_string(),
            };
            write!(f, "{}: {}", field.path, marker)?;
        }
        write!(f, " }}")
    }
}

/// Resolve a dotted field path against a document.
fn lookup_path<'a>(
    obj: &'a serde_json::Map<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current: &serde_json::Value = obj.get(path.split('.').next()?)?;
    for segment in path.split('.').skip(1) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Deterministic 64-bit hash of a key value, for hashed shard keys. FNV-1a
/// over the value's canonical encoding; stable across processes.
fn hash_key_value(value: &KeyValue) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    match value {
        KeyValue::MinKey => feed(b"\x00min"),
        KeyValue::Null => feed(b"\x01null"),
        // Integral doubles hash like their integer counterparts so that
        // numerically equal keys land in the same chunk.
        KeyValue::Int(i) => {
            feed(b"\x02num");
            feed(&i.to_le_bytes());
        }
        KeyValue::Double(f) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                feed(b"\x02num");
                feed(&(*f as i64).to_le_bytes());
            } else {
                feed(b"\x03dbl");
                feed(&f.to_bits().to_le_bytes());
            }
        }
        KeyValue::String(s) => {
            feed(b"\x04str");
            feed(s.as_bytes());
        }
        KeyValue::Bool(b) => {
            feed(b"\x05bool");
            feed(&[u8::from(*b)]);
        }
        KeyValue::MaxKey => feed(b"\x06max"),
        KeyValue::Reversed(inner) => return hash_key_value(inner),
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sentinel_ordering() {
        let values = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Int(-5),
            KeyValue::Int(100),
            KeyValue::String("a".into()),
            KeyValue::Bool(false),
            KeyValue::MaxKey,
        ];
        for window in values.windows(2) {
            assert!(window[0] < window[1], "{} < {}", window[0], window[1]);
        }
    }

    #[test]
    fn test_numeric_cross_type_ordering() {
        assert!(KeyValue::Int(1) < KeyValue::Double(1.5));
        assert!(KeyValue::Double(0.5) < KeyValue::Int(1));
        // Numerically equal but distinct representations stay ordered and
        // unequal, keeping Ord consistent with Eq.
        assert!(KeyValue::Int(1) < KeyValue::Double(1.0));
        assert_ne!(KeyValue::Int(1), KeyValue::Double(1.0));
    }

    #[test]
    fn test_key_lexicographic_order() {
        let a = Key::new(vec![KeyValue::Int(1), KeyValue::String("b".into())]);
        let b = Key::new(vec![KeyValue::Int(1), KeyValue::String("c".into())]);
        let c = Key::new(vec![KeyValue::Int(2), KeyValue::MinKey]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_extract_full_key() {
        let pattern = ShardKeyPattern::ascending("x");
        let key = pattern.extract(&json!({"x": 42, "payload": "a"})).unwrap();
        assert_eq!(key, Key::single(KeyValue::Int(42)));

        let err = pattern.extract(&json!({"payload": "a"})).unwrap_err();
        assert!(matches!(err, ShardError::ShardKeyNotFound(_)));
    }

    #[test]
    fn test_extract_dotted_path() {
        let pattern = ShardKeyPattern::ascending("user.id");
        let key = pattern
            .extract(&json!({"user": {"id": "u1"}, "v": 1}))
            .unwrap();
        assert_eq!(key, Key::single(KeyValue::String("u1".into())));
    }

    #[test]
    fn test_extract_from_equality_filter() {
        let pattern = ShardKeyPattern::ascending("x");
        assert_eq!(
            pattern.extract_from_equality(&json!({"x": 7})),
            Some(Key::single(KeyValue::Int(7)))
        );
        // Operator document is a range, not an equality.
        assert_eq!(
            pattern.extract_from_equality(&json!({"x": {"$gte": 7}})),
            None
        );
        assert_eq!(pattern.extract_from_equality(&json!({"y": 7})), None);
    }

    #[test]
    fn test_global_bounds_contain_everything() {
        let pattern = ShardKeyPattern::ascending("x");
        let min = pattern.global_min();
        let max = pattern.global_max();
        let k = pattern.extract(&json!({"x": 0})).unwrap();
        assert!(min < k);
        assert!(k < max);
    }

    #[test]
    fn test_descending_field_reverses_order() {
        let pattern = ShardKeyPattern::new(vec![ShardKeyField {
            path: "x".into(),
            direction: KeyDirection::Descending,
        }])
        .unwrap();
        let k1 = pattern.extract(&json!({"x": 1})).unwrap();
        let k2 = pattern.extract(&json!({"x": 2})).unwrap();
        assert!(k2 < k1);
        assert!(pattern.global_min() < k2);
        assert!(k1 < pattern.global_max());
    }

    #[test]
    fn test_hashed_field_is_deterministic() {
        let pattern = ShardKeyPattern::hashed("x");
        let a = pattern.extract(&json!({"x": "abc"})).unwrap();
        let b = pattern.extract(&json!({"x": "abc"})).unwrap();
        assert_eq!(a, b);
        let c = pattern.extract(&json!({"x": "abd"})).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_hashed_integral_double_matches_int() {
        assert_eq!(
            hash_key_value(&KeyValue::Int(42)),
            hash_key_value(&KeyValue::Double(42.0))
        );
    }
}
