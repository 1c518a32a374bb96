/// Errors raised while building keys and addresses at startup.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("key fields [{field}] expect {expected} component(s), key type has {actual}")]
    KeyArity {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("malformed extra key param `{param}`, expected `key:value`")]
    MalformedKeyParam { param: String },
    #[error("entity name must not be empty")]
    EmptyName,
    #[error("address `{source_unique_id}` is already registered")]
    Duplicate { source_unique_id: String },
}
