use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use opentelemetry::{Array, KeyValue, Value};

/// A unique set of attributes used as the key of an aggregation table.
///
/// Keys are sorted and unique (the last value recorded for a key wins), so two
/// sets built from the same pairs in a different order compare equal. The hash
/// is computed once at construction.
#[derive(Clone, Debug, Default)]
pub(crate) struct AttributeSet(Vec<KeyValue>, u64);

impl From<&[KeyValue]> for AttributeSet {
    fn from(values: &[KeyValue]) -> Self {
        let mut vec = values.to_vec();
        // stable sort keeps recording order between equal keys
        vec.sort_by(|a, b| a.key.cmp(&b.key));

        // we cannot use vec.dedup_by because it keeps the first duplicate, not the last
        if vec.len() > 1 {
            let mut i = vec.len() - 1;
            while i != 0 {
                if vec[i - 1].key == vec[i].key {
                    vec.remove(i - 1);
                }
                i -= 1;
            }
        }

        let hash = calculate_hash(&vec);
        AttributeSet(vec, hash)
    }
}

impl AttributeSet {
    pub(crate) fn into_vec(self) -> Vec<KeyValue> {
        self.0
    }
}

#[cfg(test)]
impl AttributeSet {
    fn iter(&self) -> impl Iterator<Item = (&opentelemetry::Key, &Value)> {
        self.0.iter().map(|kv| (&kv.key, &kv.value))
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

fn calculate_hash(values: &[KeyValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for kv in values {
        kv.key.hash(&mut hasher);
        hash_value(&kv.value, &mut hasher);
    }
    hasher.finish()
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Bool(b) => b.hash(state),
        Value::I64(i) => i.hash(state),
        Value::F64(f) => f.to_bits().hash(state),
        Value::String(s) => s.as_str().hash(state),
        Value::Array(Array::Bool(b)) => b.hash(state),
        Value::Array(Array::I64(i)) => i.hash(state),
        Value::Array(Array::F64(f)) => f.iter().for_each(|f| f.to_bits().hash(state)),
        Value::Array(Array::String(s)) => s.iter().for_each(|s| s.as_str().hash(state)),
        other => other.as_str().hash(state),
    }
}

/// Bitwise float comparison so that a set holding `NaN` still equals itself.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
        (Value::Array(Array::F64(a)), Value::Array(Array::F64(b))) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits())
        }
        (a, b) => a == b,
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
            && self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.key == b.key && value_eq(&a.value, &b.value))
    }
}

impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn order_independent_equality() {
        let a = AttributeSet::from(&[KeyValue::new("k1", "v1"), KeyValue::new("k2", 2)][..]);
        let b = AttributeSet::from(&[KeyValue::new("k2", 2), KeyValue::new("k1", "v1")][..]);

        assert_eq!(a, b);
        let set: HashSet<AttributeSet> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let set = AttributeSet::from(
            &[
                KeyValue::new("k", "first"),
                KeyValue::new("other", true),
                KeyValue::new("k", "last"),
            ][..],
        );

        assert_eq!(set.len(), 2);
        let values: Vec<_> = set.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        assert_eq!(
            values,
            vec![("k", Value::from("last")), ("other", Value::Bool(true))]
        );
    }

    #[test]
    fn nan_values_are_equal_to_themselves() {
        let a = AttributeSet::from(&[KeyValue::new("ratio", f64::NAN)][..]);
        let b = AttributeSet::from(&[KeyValue::new("ratio", f64::NAN)][..]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_values_differ() {
        let a = AttributeSet::from(&[KeyValue::new("k", 1)][..]);
        let b = AttributeSet::from(&[KeyValue::new("k", 2)][..]);
        let c = AttributeSet::from(&[KeyValue::new("k", "1")][..]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
