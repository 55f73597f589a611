//! Version-based conflict detection and field-level reconciliation.
//!
//! Divergence is decided by the `version` counter alone; device clocks are
//! not trusted for that. `updated_at_ms` is only reported as a hint for
//! picking a strategy.
//!
//! ```
//! use fieldsync::conflict::{detect_conflict, resolve_conflict, ConflictStrategy, VersionedRecord};
//! use serde_json::json;
//!
//! let local = VersionedRecord::from_json(json!({"version": 2, "updated_at_ms": 20, "name": "Ana", "phone": null})).unwrap();
//! let server = VersionedRecord::from_json(json!({"version": 3, "updated_at_ms": 10, "name": "Ann", "phone": "555"})).unwrap();
//!
//! assert!(detect_conflict(&local, &server).has_conflict);
//! let merged = resolve_conflict(&local, &server, ConflictStrategy::Merge).unwrap();
//! assert_eq!(merged.fields["name"], "Ana");
//! assert_eq!(merged.fields["phone"], "555");
//! ```

use std::{collections::BTreeSet, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{TimestampMs, Version};

/// One copy of a logical record, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Write counter, bumped on every successful write.
    pub version: Version,
    /// Last modification time.
    pub updated_at_ms: TimestampMs,
    /// Remaining record fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl VersionedRecord {
    /// Builds a record from its parts.
    pub fn new(version: Version, updated_at_ms: TimestampMs, fields: Map<String, Value>) -> Self {
        Self {
            version,
            updated_at_ms,
            fields,
        }
    }

    /// Decodes a flat JSON object carrying `version` and `updated_at_ms`.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Encodes back to a flat JSON object, e.g. to become a mutation payload.
    pub fn to_json(&self) -> Value {
        let mut out = self.fields.clone();
        out.insert("version".to_string(), Value::from(self.version));
        out.insert("updated_at_ms".to_string(), Value::from(self.updated_at_ms));
        Value::Object(out)
    }
}

/// Result of [`detect_conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictInfo {
    /// Versions differ.
    pub has_conflict: bool,
    /// Local copy has the later timestamp. Informational only.
    pub local_newer: bool,
}

/// How to reconcile two diverged copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Local fields overwrite server fields.
    ClientWins,
    /// Server fields overwrite local fields.
    ServerWins,
    /// Local non-null fields win, nulls are filled from the server.
    Merge,
    /// Refuse to choose; a human must.
    Manual,
}

impl ConflictStrategy {
    /// Wire name of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(ConflictError::UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict resolution failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConflictError {
    /// The `manual` strategy was selected; both copies are handed back.
    #[error("manual conflict resolution required (fields: {})", .fields.join(", "))]
    ManualResolutionRequired {
        /// Local copy.
        local: Box<VersionedRecord>,
        /// Server copy.
        server: Box<VersionedRecord>,
        /// Fields whose values differ.
        fields: Vec<String>,
    },
    /// A strategy name that is not one of the four known ones.
    #[error("unknown conflict strategy: {0}")]
    UnknownStrategy(String),
}

/// Compares versions to decide whether the copies diverged.
pub fn detect_conflict(local: &VersionedRecord, server: &VersionedRecord) -> ConflictInfo {
    ConflictInfo {
        has_conflict: local.version != server.version,
        local_newer: local.updated_at_ms > server.updated_at_ms,
    }
}

/// Field names whose values differ between the copies. Absent counts as null.
pub fn conflicting_fields(local: &VersionedRecord, server: &VersionedRecord) -> Vec<String> {
    let keys: BTreeSet<&String> = local.fields.keys().chain(server.fields.keys()).collect();
    keys.into_iter()
        .filter(|key| {
            let l = local.fields.get(*key).unwrap_or(&Value::Null);
            let s = server.fields.get(*key).unwrap_or(&Value::Null);
            l != s
        })
        .cloned()
        .collect()
}

/// Reconciles two copies under `strategy`.
///
/// The result carries the higher of the two versions and timestamps so the
/// next write is judged against the latest known server state.
pub fn resolve_conflict(
    local: &VersionedRecord,
    server: &VersionedRecord,
    strategy: ConflictStrategy,
) -> Result<VersionedRecord, ConflictError> {
    let fields = match strategy {
        ConflictStrategy::ClientWins => overlay(&server.fields, &local.fields),
        ConflictStrategy::ServerWins => overlay(&local.fields, &server.fields),
        ConflictStrategy::Merge => {
            let mut out = local.fields.clone();
            for (key, server_value) in &server.fields {
                let missing = out.get(key).is_none_or(Value::is_null);
                if missing {
                    out.insert(key.clone(), server_value.clone());
                }
            }
            out
        }
        ConflictStrategy::Manual => {
            return Err(ConflictError::ManualResolutionRequired {
                local: Box::new(local.clone()),
                server: Box::new(server.clone()),
                fields: conflicting_fields(local, server),
            });
        }
    };

    Ok(VersionedRecord {
        version: local.version.max(server.version),
        updated_at_ms: local.updated_at_ms.max(server.updated_at_ms),
        fields,
    })
}

fn overlay(base: &Map<String, Value>, top: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (key, value) in top {
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Detection plus resolution with a fixed strategy, for use inside processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Resolver that always applies `strategy`.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// `Ok(None)` when the versions agree, otherwise the reconciled record.
    pub fn reconcile(
        &self,
        local: &VersionedRecord,
        server: &VersionedRecord,
    ) -> Result<Option<VersionedRecord>, ConflictError> {
        if !detect_conflict(local, server).has_conflict {
            return Ok(None);
        }
        resolve_conflict(local, server, self.strategy).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rec(value: Value) -> VersionedRecord {
        VersionedRecord::from_json(value).expect("record")
    }

    #[test]
    fn equal_versions_do_not_conflict_even_with_skewed_clocks() {
        let local = rec(json!({"version": 1, "updated_at_ms": 9_999}));
        let server = rec(json!({"version": 1, "updated_at_ms": 1}));
        let info = detect_conflict(&local, &server);
        assert!(!info.has_conflict);
        assert!(info.local_newer);
    }

    #[test]
    fn different_versions_conflict() {
        let local = rec(json!({"version": 2, "updated_at_ms": 1}));
        let server = rec(json!({"version": 1, "updated_at_ms": 5}));
        let info = detect_conflict(&local, &server);
        assert!(info.has_conflict);
        assert!(!info.local_newer);
    }

    #[test]
    fn strategy_names_round_trip() {
        for s in [
            ConflictStrategy::ClientWins,
            ConflictStrategy::ServerWins,
            ConflictStrategy::Merge,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(s.as_str().parse::<ConflictStrategy>().expect("parse"), s);
        }
        assert!(matches!(
            "newest".parse::<ConflictStrategy>(),
            Err(ConflictError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn to_json_flattens_version_fields() {
        let r = rec(json!({"version": 4, "updated_at_ms": 8, "name": "x"}));
        assert_eq!(r.to_json(), json!({"version": 4, "updated_at_ms": 8, "name": "x"}));
        assert!(!r.fields.contains_key("version"));
    }
}
