//! Persisted resource records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};
use crate::types::ResourceStatus;

/// The persisted unit of state: one record per resource FQN.
///
/// `props` and `output` hold canonical (serialized) values produced by the
/// value codec; this crate never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Resource type tag, e.g. `"aws::Bucket"`.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Status as last committed.
    pub status: ResourceStatus,

    /// Desired-state input as last applied.
    #[serde(default)]
    pub props: serde_json::Value,

    /// Everything the handler returned, merged over the props.
    #[serde(default)]
    pub output: serde_json::Value,

    /// FQNs of other resources referenced from props or output.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// When the resource was first created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Convert to the JSON document stored under the resource FQN.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a stored document.
    pub fn from_json(fqn: &str, value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| StratumError::state(format!("Corrupted record at {fqn}: {e}")))
    }

    /// Returns true if the record must go through its handler again even
    /// when props are unchanged.
    pub fn needs_retry(&self) -> bool {
        self.status.needs_retry()
    }
}

/// A replaced resource whose old incarnation still has to be deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeletion {
    /// FQN of the resource (shared with its replacement).
    pub fqn: String,

    /// Resource type tag used to look up the delete handler.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Props of the old incarnation.
    #[serde(default)]
    pub props: serde_json::Value,

    /// Output of the old incarnation.
    #[serde(default)]
    pub output: serde_json::Value,

    /// Dependencies of the old incarnation.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// When the old incarnation was created, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the entry was queued.
    #[serde(default = "Utc::now")]
    pub queued_at: DateTime<Utc>,
}

impl PendingDeletion {
    /// Queue the old incarnation described by `record`.
    pub fn from_record(fqn: &str, record: &ResourceRecord) -> Self {
        Self {
            fqn: fqn.to_string(),
            type_name: record.type_name.clone(),
            props: record.props.clone(),
            output: record.output.clone(),
            depends_on: record.depends_on.clone(),
            created_at: Some(record.created_at),
            queued_at: Utc::now(),
        }
    }

    /// The `fqn` of a stored entry, if it has one.
    pub fn entry_fqn(value: &serde_json::Value) -> Option<&str> {
        value.get("fqn").and_then(|v| v.as_str())
    }

    /// Parse a stored entry, tolerating missing or malformed optional fields.
    ///
    /// Only `fqn` and `type` are required; without them nothing can be
    /// deleted and the reason is returned instead.
    pub fn from_json_lenient(value: &serde_json::Value) -> std::result::Result<Self, String> {
        Self::from_json_with_fallback(value, None)
    }

    /// Like [`PendingDeletion::from_json_lenient`], using `fallback_type`
    /// when the entry has no `type`.
    pub fn from_json_with_fallback(
        value: &serde_json::Value,
        fallback_type: Option<&str>,
    ) -> std::result::Result<Self, String> {
        let fqn = Self::entry_fqn(value).ok_or_else(|| "missing fqn".to_string())?;
        let type_name = value
            .get("type")
            .and_then(|v| v.as_str())
            .or(fallback_type)
            .ok_or_else(|| format!("entry for {fqn} is missing its type"))?;

        let depends_on = value
            .get("dependsOn")
            .and_then(|v| v.as_array())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let timestamp = |field: &str| {
            value
                .get(field)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Ok(Self {
            fqn: fqn.to_string(),
            type_name: type_name.to_string(),
            props: value.get("props").cloned().unwrap_or_default(),
            output: value.get("output").cloned().unwrap_or_default(),
            depends_on,
            created_at: timestamp("createdAt"),
            queued_at: timestamp("queuedAt").unwrap_or_else(Utc::now),
        })
    }

    /// Returns true if both entries describe the same incarnation.
    ///
    /// Creation times are compared only when both sides carry one.
    pub fn same_incarnation(&self, other: &PendingDeletion) -> bool {
        let created = match (self.created_at, other.created_at) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.fqn == other.fqn
            && self.type_name == other.type_name
            && self.output == other.output
            && created
    }

    /// Returns true if `record`, stored at `fqn`, is this incarnation.
    pub fn describes(&self, fqn: &str, record: &ResourceRecord) -> bool {
        self.same_incarnation(&Self::from_record(fqn, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ResourceRecord {
        ResourceRecord {
            type_name: "test::Bucket".to_string(),
            status: ResourceStatus::Created,
            props: json!({"name": "logs"}),
            output: json!({"name": "logs", "arn": "arn:logs"}),
            depends_on: vec!["app/dev/kms".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_layout() {
        let value = record().to_json().unwrap();
        assert_eq!(value["type"], "test::Bucket");
        assert_eq!(value["status"], "created");
        assert_eq!(value["dependsOn"][0], "app/dev/kms");
        assert!(value.get("createdAt").is_some());

        let parsed = ResourceRecord::from_json("app/dev/bucket", value).unwrap();
        assert_eq!(parsed, record_with_times(&parsed));
    }

    fn record_with_times(other: &ResourceRecord) -> ResourceRecord {
        ResourceRecord {
            created_at: other.created_at,
            updated_at: other.updated_at,
            ..record()
        }
    }

    #[test]
    fn test_corrupted_record() {
        let err = ResourceRecord::from_json("app/dev/x", json!({"status": 3})).unwrap_err();
        assert!(err.to_string().contains("app/dev/x"));
    }

    #[test]
    fn test_pending_lenient() {
        let entry = PendingDeletion::from_json_lenient(&json!({
            "fqn": "app/dev/r",
            "type": "test::Replacable",
        }))
        .unwrap();
        assert_eq!(entry.fqn, "app/dev/r");
        assert!(entry.output.is_null());
        assert!(entry.depends_on.is_empty());

        assert!(PendingDeletion::from_json_lenient(&json!({"type": "x"})).is_err());
        assert!(PendingDeletion::from_json_lenient(&json!({"fqn": "app/dev/r"})).is_err());
        assert!(PendingDeletion::from_json_lenient(&json!("garbage")).is_err());
    }

    #[test]
    fn test_pending_type_fallback() {
        let raw = json!({"fqn": "app/dev/r"});
        let entry = PendingDeletion::from_json_with_fallback(&raw, Some("test::Bucket")).unwrap();
        assert_eq!(entry.type_name, "test::Bucket");

        let typed = json!({"fqn": "app/dev/r", "type": "test::Other"});
        let entry = PendingDeletion::from_json_with_fallback(&typed, Some("test::Bucket")).unwrap();
        assert_eq!(entry.type_name, "test::Other");

        assert!(PendingDeletion::from_json_with_fallback(&json!({}), Some("test::Bucket")).is_err());
    }

    #[test]
    fn test_pending_describes_live_record() {
        let live = record();
        let entry = PendingDeletion::from_record("app/dev/bucket", &live);
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(PendingDeletion::from_json_lenient(&value).unwrap().describes("app/dev/bucket", &live));

        let recreated = ResourceRecord {
            created_at: live.created_at + chrono::Duration::seconds(1),
            ..live.clone()
        };
        assert!(!entry.describes("app/dev/bucket", &recreated));
        assert!(!entry.describes("app/dev/other", &live));
    }

    #[test]
    fn test_pending_from_record() {
        let entry = PendingDeletion::from_record("app/dev/bucket", &record());
        let value = serde_json::to_value(&entry).unwrap();
        let parsed = PendingDeletion::from_json_lenient(&value).unwrap();
        assert!(parsed.same_incarnation(&entry));
        assert_eq!(parsed.depends_on, entry.depends_on);
    }
}
