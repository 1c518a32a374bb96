//! Deterministic storage addresses for entity types.
//!
//! Every entity type gets one [`UniqueAddress`], computed once at startup
//! from its [`EntityConfig`]. The address template has a single `%s` slot
//! filled with the primary-key fragment, e.g. `100:42_Inventory.v3`.
//!
//! Entity types registered under the same name with a non-zero shared id
//! form an address family: their fast-store rows are loaded together in a
//! single pipelined round trip. [`AddressRegistry`] owns all addresses and
//! resolves families; it is built at startup and handed out as `Arc`.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;
use crate::key::CacheKey;
use crate::types::KeyValue;

/// Bucket prefix shared by every fast-store address.
pub const ADDRESS_PREFIX: &str = "100";

/// Substitution slot in an address template.
pub const ADDRESS_SLOT: &str = "%s";

/// Static description of one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConfig {
    /// Entity-type (table) name.
    pub name: String,
    /// Schema version. Bumping it moves the entity to fresh addresses.
    pub version: u32,
    /// Shared-bucket id. 0 = not shared.
    #[serde(default)]
    pub shared_id: u32,
    /// Field holding the primary key.
    pub primary_key: String,
    /// Fields that together locate the bucket. Contains `primary_key`;
    /// empty means `[primary_key]`.
    #[serde(default)]
    pub primary_key_fields: Vec<String>,
    /// Fields identifying one entity within the bucket.
    #[serde(default)]
    pub secondary_key_fields: Vec<String>,
    /// Constant key bindings, `key:value#key:value`.
    #[serde(default)]
    pub extra_key_params: String,
    /// Whether writes go through the delay cache.
    #[serde(default)]
    pub delay_update: bool,
}

impl EntityConfig {
    /// Minimal config: unshared, no extra keys, one secondary field.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: u32,
        primary_key: impl Into<String>,
        secondary_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            shared_id: 0,
            primary_key: primary_key.into(),
            primary_key_fields: Vec::new(),
            secondary_key_fields: vec![secondary_key.into()],
            extra_key_params: String::new(),
            delay_update: true,
        }
    }

    #[must_use]
    pub fn with_shared_id(mut self, shared_id: u32) -> Self {
        self.shared_id = shared_id;
        self
    }

    #[must_use]
    pub fn with_primary_key_fields(mut self, fields: Vec<String>) -> Self {
        self.primary_key_fields = fields;
        self
    }

    #[must_use]
    pub fn with_extra_key_params(mut self, params: impl Into<String>) -> Self {
        self.extra_key_params = params.into();
        self
    }
}

/// Parses `key:value#key:value` into ordered key bindings.
fn parse_extra_key_params(params: &str) -> Result<Vec<KeyValue>, AddressError> {
    if params.is_empty() {
        return Ok(Vec::new());
    }
    params
        .split('#')
        .map(|pair| match pair.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok(KeyValue::new(key, value)),
            _ => Err(AddressError::MalformedKeyParam {
                param: pair.to_string(),
            }),
        })
        .collect()
}

/// Deterministic address of one entity type.
///
/// Immutable after construction. Equality and hashing use the source
/// unique id: `(name, shared id, unique keys, extra params)`.
#[derive(Debug, Clone)]
pub struct UniqueAddress {
    name: String,
    version: u32,
    shared_id: u32,
    primary_key: String,
    unique_keys: Vec<String>,
    secondary_keys: Vec<String>,
    extra_key_params: Vec<KeyValue>,
    template: String,
    source_unique_id: String,
}

impl UniqueAddress {
    /// Builds the address and its template from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the extra key params are
    /// malformed.
    pub fn new(config: &EntityConfig) -> Result<Self, AddressError> {
        if config.name.is_empty() {
            return Err(AddressError::EmptyName);
        }
        let extra_key_params = parse_extra_key_params(&config.extra_key_params)?;

        let unique_keys: Vec<String> = config
            .primary_key_fields
            .iter()
            .filter(|field| **field != config.primary_key)
            .cloned()
            .collect();

        let shared = if config.shared_id > 0 {
            format!(".{}", config.shared_id)
        } else {
            String::new()
        };
        let template = if unique_keys.is_empty() {
            format!(
                "{ADDRESS_PREFIX}:{ADDRESS_SLOT}_{}{shared}.v{}",
                config.name, config.version
            )
        } else {
            format!(
                "{ADDRESS_PREFIX}:{ADDRESS_SLOT}_{}_{}{shared}.v{}",
                unique_keys.join("."),
                config.name,
                config.version
            )
        };

        let mut combined = vec![config.primary_key.clone()];
        combined.extend(unique_keys.iter().cloned());
        combined.extend(config.secondary_key_fields.iter().cloned());
        let source_unique_id = format!(
            "{}_{}_{}_{}",
            config.name,
            config.shared_id,
            combined.join(","),
            config.extra_key_params
        );

        Ok(Self {
            name: config.name.clone(),
            version: config.version,
            shared_id: config.shared_id,
            primary_key: config.primary_key.clone(),
            unique_keys,
            secondary_keys: config.secondary_key_fields.clone(),
            extra_key_params,
            template,
            source_unique_id,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn shared_id(&self) -> u32 {
        self.shared_id
    }

    /// Whether this entity type's rows co-reside with siblings.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared_id > 0
    }

    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Non-primary fields that take part in the bucket key.
    #[must_use]
    pub fn unique_keys(&self) -> &[String] {
        &self.unique_keys
    }

    #[must_use]
    pub fn secondary_keys(&self) -> &[String] {
        &self.secondary_keys
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    pub fn source_unique_id(&self) -> &str {
        &self.source_unique_id
    }

    /// Substitutes `fragment` into the template.
    #[must_use]
    pub fn address_for(&self, fragment: &str) -> String {
        self.template.replacen(ADDRESS_SLOT, fragment, 1)
    }

    /// Address for a primary key's string form.
    #[must_use]
    pub fn address_for_key<PK: CacheKey>(&self, primary_key: &PK) -> String {
        self.address_for(&primary_key.key_string())
    }

    /// Extra key params followed by the primary key binding.
    #[must_use]
    pub fn primary_unique_keys<PK: CacheKey>(&self, primary_key: &PK) -> Vec<KeyValue> {
        let mut values = self.extra_key_params.clone();
        values.extend(primary_key.components().into_iter().map(|value| KeyValue {
            name: self.primary_key.clone(),
            value,
        }));
        values
    }

    /// All addresses loaded together with this one, self included.
    ///
    /// Unshared addresses only have themselves. Shared ones return every
    /// shared address registered under the same name, ordered by shared id.
    #[must_use]
    pub fn sibling_addresses(self: &Arc<Self>, registry: &AddressRegistry) -> Vec<Arc<Self>> {
        if !self.is_shared() {
            return vec![Arc::clone(self)];
        }
        let mut siblings: Vec<Arc<Self>> = registry
            .family(&self.name)
            .iter()
            .filter(|address| address.is_shared())
            .cloned()
            .collect();
        if !siblings.iter().any(|address| **address == **self) {
            siblings.push(Arc::clone(self));
        }
        siblings.sort_by_key(|address| address.shared_id);
        siblings
    }
}

impl PartialEq for UniqueAddress {
    fn eq(&self, other: &Self) -> bool {
        self.source_unique_id == other.source_unique_id
    }
}

impl Eq for UniqueAddress {}

impl Hash for UniqueAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_unique_id.hash(state);
    }
}

/// Startup-built registry of every entity type's address.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    by_name: HashMap<String, Vec<Arc<UniqueAddress>>>,
}

impl AddressRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and registers the address for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or an equal address is
    /// already registered.
    pub fn register(&mut self, config: &EntityConfig) -> Result<Arc<UniqueAddress>, AddressError> {
        let address = UniqueAddress::new(config)?;
        let family = self.by_name.entry(address.name.clone()).or_default();
        if family.iter().any(|existing| **existing == address) {
            return Err(AddressError::Duplicate {
                source_unique_id: address.source_unique_id,
            });
        }
        let address = Arc::new(address);
        family.push(Arc::clone(&address));
        tracing::debug!(
            entity = %address.name,
            template = %address.template,
            "registered cache address"
        );
        Ok(address)
    }

    /// Every address registered under `name`, in registration order.
    #[must_use]
    pub fn family(&self, name: &str) -> &[Arc<UniqueAddress>] {
        self.by_name.get(name).map_or(&[], Vec::as_slice)
    }

    /// Looks up the address of `name` with the given shared id.
    #[must_use]
    pub fn get(&self, name: &str, shared_id: u32) -> Option<Arc<UniqueAddress>> {
        self.family(name)
            .iter()
            .find(|address| address.shared_id == shared_id)
            .cloned()
    }

    /// Number of registered addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn inventory() -> EntityConfig {
        EntityConfig::new("Inventory", 3, "playerId", "itemId")
    }

    #[test]
    fn unshared_address_without_unique_keys() {
        let address = UniqueAddress::new(&inventory()).unwrap();
        assert_eq!(address.template(), "100:%s_Inventory.v3");
        assert_eq!(address.address_for_key(&42_i64), "100:42_Inventory.v3");
        assert!(!address.is_shared());
    }

    #[test]
    fn shared_address_appends_shared_id() {
        let address = UniqueAddress::new(&inventory().with_shared_id(7)).unwrap();
        assert_eq!(address.address_for_key(&42_i64), "100:42_Inventory.7.v3");
        assert!(address.is_shared());
    }

    #[test]
    fn non_primary_unique_keys_join_with_dot() {
        let config = inventory().with_primary_key_fields(vec![
            "serverId".to_string(),
            "playerId".to_string(),
            "zone".to_string(),
        ]);
        let address = UniqueAddress::new(&config).unwrap();
        assert_eq!(address.template(), "100:%s_serverId.zone_Inventory.v3");
        assert_eq!(address.address_for("9_42"), "100:9_42_serverId.zone_Inventory.v3");
    }

    #[test]
    fn equality_ignores_version() {
        let v3 = UniqueAddress::new(&inventory()).unwrap();
        let mut v4_config = inventory();
        v4_config.version = 4;
        let v4 = UniqueAddress::new(&v4_config).unwrap();
        assert_eq!(v3, v4);
        assert_ne!(v3.template(), v4.template());

        let shared = UniqueAddress::new(&inventory().with_shared_id(1)).unwrap();
        assert_ne!(v3, shared);
    }

    #[test]
    fn extra_key_params_prefix_primary_unique_keys() {
        let config = inventory().with_extra_key_params("serverId:9#realm:eu");
        let address = UniqueAddress::new(&config).unwrap();
        assert_eq!(
            address.primary_unique_keys(&42_i64),
            vec![
                KeyValue::new("serverId", "9"),
                KeyValue::new("realm", "eu"),
                KeyValue::new("playerId", 42_i64),
            ]
        );
    }

    #[test]
    fn malformed_extra_key_params_are_rejected() {
        let config = inventory().with_extra_key_params("serverId");
        assert!(matches!(
            UniqueAddress::new(&config),
            Err(AddressError::MalformedKeyParam { .. })
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let config = EntityConfig::new("", 1, "playerId", "itemId");
        assert!(matches!(UniqueAddress::new(&config), Err(AddressError::EmptyName)));
    }

    #[test]
    fn registry_resolves_shared_family_in_shared_id_order() {
        let mut registry = AddressRegistry::new();
        let b = registry.register(&inventory().with_shared_id(2)).unwrap();
        let a = registry.register(&inventory().with_shared_id(1)).unwrap();
        let unshared = registry.register(&EntityConfig::new("Mail", 1, "playerId", "mailId")).unwrap();

        let siblings = b.sibling_addresses(&registry);
        let ids: Vec<u32> = siblings.iter().map(|address| address.shared_id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(a.sibling_addresses(&registry).len(), 2);
        assert_eq!(unshared.sibling_addresses(&registry), vec![unshared.clone()]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("Inventory", 2), Some(b));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = AddressRegistry::new();
        registry.register(&inventory()).unwrap();
        assert!(matches!(
            registry.register(&inventory()),
            Err(AddressError::Duplicate { .. })
        ));
    }

    proptest! {
        #[test]
        fn addresses_differ_only_in_fragment(a in any::<i64>(), b in any::<i64>(), shared in 0u32..10) {
            let address = UniqueAddress::new(&inventory().with_shared_id(shared)).unwrap();
            let first = address.address_for_key(&a);
            let second = address.address_for_key(&b);
            prop_assert_eq!(&first, &address.address_for_key(&a));
            let suffix = address.template().trim_start_matches("100:%s");
            prop_assert_eq!(first, format!("100:{a}{suffix}"));
            prop_assert_eq!(second, format!("100:{b}{suffix}"));
        }
    }
}
