//! Dependency extraction from canonical trees.

use std::collections::BTreeSet;

/// FQNs of every resource referenced by a canonical (serialized) tree.
///
/// Only direct references count: the embedded output of a referenced
/// resource is not searched.
pub fn dependencies(json: &serde_json::Value) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    collect(json, &mut found);
    found
}

fn collect(json: &serde_json::Value, found: &mut BTreeSet<String>) {
    match json {
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(fqn) = map
                    .get("@resource")
                    .and_then(|r| r.get("fqn"))
                    .and_then(|f| f.as_str())
                {
                    found.insert(fqn.to_string());
                    return;
                }
                // Secrets and dates hold no references.
                if map.contains_key("@secret") || map.contains_key("@date") {
                    return;
                }
            }
            map.values().for_each(|v| collect(v, found));
        }
        _ => {}
    }
}
