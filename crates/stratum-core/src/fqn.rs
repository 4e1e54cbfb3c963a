//! Fully-qualified names and the state key layout.
//!
//! Resource records live at `<scope chain>/<id>`. Scope-local key/value
//! pairs live under the reserved `<scope chain>/$scope/` namespace. A
//! resource's own nested resources live in a child scope named after it.

use crate::error::{Result, StratumError};

/// Reserved segment holding scope-local key/value pairs.
pub const SCOPE_NAMESPACE: &str = "$scope";

/// Separator between FQN segments.
pub const SEPARATOR: char = '/';

/// Check a resource id or scope name.
pub fn validate_segment(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StratumError::validation(format!("{kind} cannot be empty")));
    }
    if name.contains(SEPARATOR) {
        return Err(StratumError::validation(format!(
            "{kind} '{name}' cannot contain '{SEPARATOR}'"
        )));
    }
    if name.starts_with('$') {
        return Err(StratumError::validation(format!(
            "{kind} '{name}' cannot start with '$'"
        )));
    }
    Ok(())
}

/// Join a scope chain into its FQN.
pub fn join(chain: &[String]) -> String {
    chain.join("/")
}

/// FQN of a direct child (resource or scope) of `parent`.
pub fn child(parent: &str, name: &str) -> String {
    format!("{parent}{SEPARATOR}{name}")
}

/// Store key for a scope-local value.
pub fn scope_data_key(scope: &str, key: &str) -> String {
    format!("{scope}{SEPARATOR}{SCOPE_NAMESPACE}{SEPARATOR}{key}")
}

/// Prefix covering everything stored beneath a scope.
pub fn prefix(scope: &str) -> String {
    format!("{scope}{SEPARATOR}")
}

/// What a stored key is, relative to the scope that listed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredKey<'a> {
    /// A resource record owned directly by the scope.
    Resource(&'a str),
    /// Something inside a nested scope with this name.
    Nested(&'a str),
    /// Scope-local key/value data.
    ScopeData,
}

/// Classify a key returned by `list(prefix(scope))`.
pub fn classify<'a>(scope: &str, key: &'a str) -> Option<StoredKey<'a>> {
    let rest = key.strip_prefix(scope)?.strip_prefix(SEPARATOR)?;
    match rest.split_once(SEPARATOR) {
        None if rest.is_empty() => None,
        None => Some(StoredKey::Resource(rest)),
        Some((SCOPE_NAMESPACE, _)) => Some(StoredKey::ScopeData),
        Some((first, _)) => Some(StoredKey::Nested(first)),
    }
}

/// The local id (last segment) of an FQN.
pub fn local_id(fqn: &str) -> &str {
    fqn.rsplit(SEPARATOR).next().unwrap_or(fqn)
}
