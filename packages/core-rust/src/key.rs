//! Cache keys and the key-value builder.
//!
//! A primary key groups entities (e.g. a player id); a secondary key
//! identifies one entity within the group. [`CacheKey`] gives both the
//! ordered component values and the string form used in fast-store hash
//! fields and address fragments. [`KeyValueBuilder`] binds the components to
//! field names so durable-store queries can be built from them.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::error::AddressError;
use crate::types::{KeyValue, Value};

/// Separator between components in the string form of a composite key.
pub const COMPOSITE_KEY_SEPARATOR: char = '_';

/// A key usable as a primary or secondary cache key.
///
/// `Ord` is required so pending commands for one primary key iterate in a
/// stable order.
pub trait CacheKey: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Number of components this key contributes to a composite key.
    const ARITY: usize;

    /// Ordered component values.
    fn components(&self) -> Vec<Value>;

    /// String form used in hash fields and address fragments.
    fn key_string(&self) -> String;
}

macro_rules! scalar_cache_key {
    ($($ty:ty),*) => {
        $(
            impl CacheKey for $ty {
                const ARITY: usize = 1;

                fn components(&self) -> Vec<Value> {
                    vec![Value::from(self.clone())]
                }

                fn key_string(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

scalar_cache_key!(i64, i32, u32, String);

impl<A: CacheKey, B: CacheKey> CacheKey for (A, B) {
    const ARITY: usize = A::ARITY + B::ARITY;

    fn components(&self) -> Vec<Value> {
        let mut values = self.0.components();
        values.extend(self.1.components());
        values
    }

    fn key_string(&self) -> String {
        format!(
            "{}{COMPOSITE_KEY_SEPARATOR}{}",
            self.0.key_string(),
            self.1.key_string()
        )
    }
}

/// Binds primary and secondary key components to their field names.
///
/// Holds only the field names; every method is a pure function of its
/// arguments.
#[derive(Debug, Clone)]
pub struct KeyValueBuilder<PK, K> {
    primary_field: String,
    secondary_fields: Vec<String>,
    _keys: PhantomData<fn() -> (PK, K)>,
}

impl<PK: CacheKey, K: CacheKey> KeyValueBuilder<PK, K> {
    /// Creates a builder for the given field names.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::KeyArity`] if the primary key is composite or
    /// the number of secondary fields differs from `K::ARITY`.
    pub fn new(
        primary_field: impl Into<String>,
        secondary_fields: Vec<String>,
    ) -> Result<Self, AddressError> {
        let primary_field = primary_field.into();
        if PK::ARITY != 1 {
            return Err(AddressError::KeyArity {
                field: primary_field,
                expected: 1,
                actual: PK::ARITY,
            });
        }
        if K::ARITY != secondary_fields.len() {
            return Err(AddressError::KeyArity {
                field: secondary_fields.join(","),
                expected: secondary_fields.len(),
                actual: K::ARITY,
            });
        }
        Ok(Self {
            primary_field,
            secondary_fields,
            _keys: PhantomData,
        })
    }

    #[must_use]
    pub fn primary_field(&self) -> &str {
        &self.primary_field
    }

    #[must_use]
    pub fn secondary_fields(&self) -> &[String] {
        &self.secondary_fields
    }

    /// `[primary_field = pk]`.
    #[must_use]
    pub fn primary_key_values(&self, primary_key: &PK) -> Vec<KeyValue> {
        primary_key
            .components()
            .into_iter()
            .map(|value| KeyValue {
                name: self.primary_field.clone(),
                value,
            })
            .collect()
    }

    /// Secondary key components bound to their field names, in order.
    #[must_use]
    pub fn secondary_key_values(&self, secondary_key: &K) -> Vec<KeyValue> {
        self.secondary_fields
            .iter()
            .zip(secondary_key.components())
            .map(|(name, value)| KeyValue {
                name: name.clone(),
                value,
            })
            .collect()
    }

    /// Primary key followed by the secondary key components.
    #[must_use]
    pub fn combine_key_values(&self, primary_key: &PK, secondary_key: &K) -> Vec<KeyValue> {
        let mut values = self.primary_key_values(primary_key);
        values.extend(self.secondary_key_values(secondary_key));
        values
    }

    #[must_use]
    pub fn primary_key_string(&self, primary_key: &PK) -> String {
        primary_key.key_string()
    }

    #[must_use]
    pub fn secondary_key_string(&self, secondary_key: &K) -> String {
        secondary_key.key_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_builder() -> KeyValueBuilder<i64, i64> {
        KeyValueBuilder::new("playerId", vec!["itemId".to_string()]).unwrap()
    }

    #[test]
    fn combine_key_values_orders_primary_first() {
        let builder = item_builder();
        let values = builder.combine_key_values(&42, &7);
        assert_eq!(
            values,
            vec![KeyValue::new("playerId", 42_i64), KeyValue::new("itemId", 7_i64)]
        );
    }

    #[test]
    fn composite_secondary_key_binds_each_field() {
        let builder: KeyValueBuilder<i64, (i32, String)> = KeyValueBuilder::new(
            "playerId",
            vec!["slot".to_string(), "tag".to_string()],
        )
        .unwrap();

        let key = (3, "gold".to_string());
        assert_eq!(
            builder.secondary_key_values(&key),
            vec![KeyValue::new("slot", 3_i32), KeyValue::new("tag", "gold")]
        );
        assert_eq!(builder.secondary_key_string(&key), "3_gold");
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let result: Result<KeyValueBuilder<i64, (i64, i64)>, _> =
            KeyValueBuilder::new("playerId", vec!["itemId".to_string()]);
        assert!(matches!(
            result,
            Err(AddressError::KeyArity { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn composite_primary_key_is_rejected() {
        let result: Result<KeyValueBuilder<(i64, i64), i64>, _> =
            KeyValueBuilder::new("playerId", vec!["itemId".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn key_strings_use_display_form() {
        let builder = item_builder();
        assert_eq!(builder.primary_key_string(&-5), "-5");
        assert_eq!(builder.secondary_key_string(&1_000), "1000");
    }
}
