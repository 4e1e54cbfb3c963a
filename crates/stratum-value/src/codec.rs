//! Canonical JSON form of live values.
//!
//! Plain JSON passes through unchanged apart from object key ordering.
//! Everything else is tagged with a single-key marker object:
//!
//! | Marker | Meaning |
//! |--------|---------|
//! | `{"@id": n, "@value": v}` | first occurrence of a shared array/object |
//! | `{"@ref": n}` | later occurrence of the same node |
//! | `{"@secret": "<base64>"}` | encrypted secret |
//! | `{"@secret": {"unencrypted": s}}` | secret stored in the clear |
//! | `{"@date": "<rfc3339>"}` | timestamp |
//! | `{"@resource": {"fqn", "type", "output"}}` | reference to another resource |
//! | `{"@object": {...}}` | user object whose keys start with `@` |
//!
//! Alias ids are assigned in document order, so serializing the same value
//! twice yields the same tree (encrypted secrets aside).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map};
use stratum_core::{Result, StratumError};
use tracing::warn;

use crate::secret::{Secret, SecretCipher};
use crate::value::{ResourceRef, Value};

const ID: &str = "@id";
const VALUE: &str = "@value";
const REF: &str = "@ref";
const SECRET: &str = "@secret";
const DATE: &str = "@date";
const RESOURCE: &str = "@resource";
const OBJECT: &str = "@object";
const UNENCRYPTED: &str = "unencrypted";

/// Converts live values to canonical JSON and back.
#[derive(Debug, Default)]
pub struct Codec {
    cipher: Option<SecretCipher>,
}

impl Codec {
    /// A codec that stores secrets unencrypted.
    pub fn new() -> Self {
        Self { cipher: None }
    }

    /// A codec that encrypts secrets with a key derived from `passphrase`.
    pub fn with_passphrase(passphrase: &str) -> Self {
        Self {
            cipher: Some(SecretCipher::from_passphrase(passphrase)),
        }
    }

    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(p) => Self::with_passphrase(p),
            None => Self::new(),
        }
    }

    /// Returns true if secrets are encrypted at rest.
    pub fn encrypts_secrets(&self) -> bool {
        self.cipher.is_some()
    }

    /// Convert a live value to its canonical form.
    ///
    /// Fails with a `Serialization` error naming the offending path when the
    /// value contains something with no canonical form.
    pub fn serialize(&self, value: &Value) -> Result<serde_json::Value> {
        let mut seen = HashMap::new();
        count_shared(value, &mut seen);

        let mut writer = Writer {
            cipher: self.cipher.as_ref(),
            shared: seen,
            ids: HashMap::new(),
        };
        writer.write(value, "$")
    }

    /// Rebuild a live value from its canonical form.
    pub fn deserialize(&self, json: &serde_json::Value) -> Result<Value> {
        let mut reader = Reader {
            cipher: self.cipher.as_ref(),
            table: HashMap::new(),
        };
        reader.read(json, "$")
    }
}

fn node_ptr(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(Arc::as_ptr(items) as *const () as usize),
        Value::Object(map) => Some(Arc::as_ptr(map) as *const () as usize),
        _ => None,
    }
}

/// Count how often each shared node is reachable. A node is only descended
/// into on its first visit.
fn count_shared(value: &Value, seen: &mut HashMap<usize, usize>) {
    if let Some(ptr) = node_ptr(value) {
        let count = seen.entry(ptr).or_insert(0);
        *count += 1;
        if *count > 1 {
            return;
        }
    }

    match value {
        Value::Array(items) => items.iter().for_each(|v| count_shared(v, seen)),
        Value::Object(map) => map.values().for_each(|v| count_shared(v, seen)),
        Value::Resource(r) => count_shared(&r.output, seen),
        _ => {}
    }
}

struct Writer<'a> {
    cipher: Option<&'a SecretCipher>,
    shared: HashMap<usize, usize>,
    ids: HashMap<usize, u64>,
}

impl Writer<'_> {
    fn write(&mut self, value: &Value, path: &str) -> Result<serde_json::Value> {
        if let Some(ptr) = node_ptr(value) {
            if self.shared.get(&ptr).copied().unwrap_or(0) > 1 {
                if let Some(id) = self.ids.get(&ptr) {
                    return Ok(json!({ REF: id }));
                }
                let id = self.ids.len() as u64;
                self.ids.insert(ptr, id);
                let inner = self.write_node(value, path)?;
                return Ok(json!({ ID: id, VALUE: inner }));
            }
        }
        self.write_node(value, path)
    }

    fn write_node(&mut self, value: &Value, path: &str) -> Result<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(t) => json!({ DATE: t.to_rfc3339_opts(SecondsFormat::AutoSi, true) }),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.write(item, &format!("{path}[{i}]"))?);
                }
                serde_json::Value::Array(out)
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map.iter() {
                    out.insert(key.clone(), self.write(item, &format!("{path}.{key}"))?);
                }
                if map.keys().any(|k| k.starts_with('@')) {
                    json!({ OBJECT: out })
                } else {
                    serde_json::Value::Object(out)
                }
            }
            Value::Secret(secret) => match self.cipher {
                Some(cipher) => json!({ SECRET: cipher.encrypt(secret.expose())? }),
                None => json!({ SECRET: { UNENCRYPTED: secret.expose() } }),
            },
            Value::Resource(r) => {
                let output = self.write(&r.output, &format!("{path}.output"))?;
                json!({ RESOURCE: { "fqn": r.fqn, "type": r.type_name, "output": output } })
            }
            Value::Opaque(handle) => {
                return Err(StratumError::Serialization {
                    resource: None,
                    path: path.to_string(),
                    message: format!("value of type {} has no canonical form", handle.type_name()),
                })
            }
        })
    }
}

struct Reader<'a> {
    cipher: Option<&'a SecretCipher>,
    table: HashMap<u64, Value>,
}

impl Reader<'_> {
    fn read(&mut self, json: &serde_json::Value, path: &str) -> Result<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.read(item, &format!("{path}[{i}]"))?);
                }
                Value::Array(Arc::new(out))
            }
            serde_json::Value::Object(map) => self.read_object(map, path)?,
        })
    }

    fn read_object(&mut self, map: &Map<String, serde_json::Value>, path: &str) -> Result<Value> {
        if let (Some(id), Some(inner), 2) = (map.get(ID), map.get(VALUE), map.len()) {
            let id = id.as_u64().ok_or_else(|| malformed(path, "alias id"))?;
            let value = self.read(inner, path)?;
            self.table.insert(id, value.clone());
            return Ok(value);
        }

        if map.len() == 1 {
            if let Some((marker, body)) = map.iter().next() {
                match marker.as_str() {
                    REF => {
                        let id = body.as_u64().ok_or_else(|| malformed(path, "alias ref"))?;
                        return self.table.get(&id).cloned().ok_or_else(|| {
                            malformed(path, &format!("reference to unknown alias {id}"))
                        });
                    }
                    SECRET => return self.read_secret(body, path),
                    DATE => {
                        let text = body.as_str().ok_or_else(|| malformed(path, "date"))?;
                        let date = DateTime::parse_from_rfc3339(text)
                            .map_err(|e| malformed(path, &format!("date: {e}")))?;
                        return Ok(Value::Date(date.with_timezone(&Utc)));
                    }
                    RESOURCE => return self.read_resource(body, path),
                    OBJECT => {
                        let inner = body.as_object().ok_or_else(|| malformed(path, "object"))?;
                        return self.read_entries(inner, path);
                    }
                    _ => {}
                }
            }
        }

        self.read_entries(map, path)
    }

    fn read_entries(&mut self, map: &Map<String, serde_json::Value>, path: &str) -> Result<Value> {
        let mut out = BTreeMap::new();
        for (key, item) in map {
            out.insert(key.clone(), self.read(item, &format!("{path}.{key}"))?);
        }
        Ok(Value::Object(Arc::new(out)))
    }

    fn read_secret(&mut self, body: &serde_json::Value, path: &str) -> Result<Value> {
        if let Some(encoded) = body.as_str() {
            let cipher = self.cipher.ok_or_else(|| {
                StratumError::Secret(format!(
                    "encrypted secret at {path} cannot be read without a passphrase"
                ))
            })?;
            return Ok(Value::Secret(Secret::new(cipher.decrypt(encoded)?)));
        }

        let plaintext = body
            .get(UNENCRYPTED)
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(path, "secret"))?;
        if self.cipher.is_some() {
            warn!(path, "Read an unencrypted secret while a passphrase is configured");
        }
        Ok(Value::Secret(Secret::new(plaintext)))
    }

    fn read_resource(&mut self, body: &serde_json::Value, path: &str) -> Result<Value> {
        let fqn = body
            .get("fqn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(path, "resource fqn"))?;
        let type_name = body
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed(path, "resource type"))?;
        let output = match body.get("output") {
            Some(output) => self.read(output, &format!("{path}.output"))?,
            None => Value::Null,
        };

        Ok(Value::Resource(ResourceRef {
            fqn: fqn.to_string(),
            type_name: type_name.to_string(),
            output: Arc::new(output),
        }))
    }
}

fn malformed(path: &str, what: &str) -> StratumError {
    StratumError::Serialization {
        resource: None,
        path: path.to_string(),
        message: format!("malformed {what} marker"),
    }
}
