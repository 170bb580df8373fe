//! Local/server version reconciliation for 409 responses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PosError, Result};

/// Fields that are bookkeeping, not content; never reported as conflicts.
const IGNORED_FIELDS: &[&str] = &["updatedAt", "syncedAt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
}

impl ConflictStrategy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "server-wins" | "server" => Ok(Self::ServerWins),
            "client-wins" | "client" => Ok(Self::ClientWins),
            "merge" => Ok(Self::Merge),
            other => Err(PosError::config(format!(
                "unknown conflict strategy '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    /// The version to keep locally.
    pub record: T,
    /// Top-level fields where local and server disagreed.
    pub conflicting_fields: Vec<String>,
    /// Whether `record` must be pushed to the server again.
    pub push_local: bool,
}

/// Reconcile `local` against `server` using `strategy`.
///
/// Merge takes the union of both field sets; where both sides carry a
/// non-null value the local one is kept.
pub fn resolve_conflict<T>(local: &T, server: &T, strategy: ConflictStrategy) -> Result<Resolution<T>>
where
    T: Serialize + DeserializeOwned,
{
    let local_value = serde_json::to_value(local)?;
    let server_value = serde_json::to_value(server)?;
    let conflicting_fields = differing_fields(&local_value, &server_value);

    let (resolved, push_local) = match strategy {
        ConflictStrategy::ServerWins => (server_value, false),
        ConflictStrategy::ClientWins => (local_value, true),
        ConflictStrategy::Merge => (merge_values(local_value, server_value), true),
    };

    Ok(Resolution {
        record: serde_json::from_value(resolved)?,
        conflicting_fields,
        push_local,
    })
}

fn differing_fields(local: &Value, server: &Value) -> Vec<String> {
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return Vec::new();
    };
    let mut fields: Vec<String> = local
        .iter()
        .filter(|(key, _)| !IGNORED_FIELDS.contains(&key.as_str()))
        .filter(|(key, value)| match server.get(*key) {
            Some(other) => !value.is_null() && !other.is_null() && *value != other,
            None => false,
        })
        .map(|(key, _)| key.clone())
        .collect();
    fields.sort();
    fields
}

fn merge_values(local: Value, server: Value) -> Value {
    match (local, server) {
        (Value::Object(local), Value::Object(server)) => {
            let mut merged: Map<String, Value> = server;
            for (key, value) in local {
                if !value.is_null() || !merged.contains_key(&key) {
                    merged.insert(key, value);
                }
            }
            Value::Object(merged)
        }
        (local, _) => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Note {
        id: String,
        title: Option<String>,
        body: Option<String>,
        pinned: bool,
        updated_at: String,
    }

    fn local() -> Note {
        Note {
            id: "n-1".into(),
            title: Some("local title".into()),
            body: None,
            pinned: true,
            updated_at: "2026-01-02".into(),
        }
    }

    fn server() -> Note {
        Note {
            id: "n-1".into(),
            title: Some("server title".into()),
            body: Some("server body".into()),
            pinned: true,
            updated_at: "2026-01-03".into(),
        }
    }

    #[test]
    fn test_server_wins_replaces_local() {
        let res = resolve_conflict(&local(), &server(), ConflictStrategy::ServerWins).unwrap();
        assert_eq!(res.record, server());
        assert!(!res.push_local);
        assert_eq!(res.conflicting_fields, vec!["title".to_string()]);
    }

    #[test]
    fn test_client_wins_keeps_local_and_pushes() {
        let res = resolve_conflict(&local(), &server(), ConflictStrategy::ClientWins).unwrap();
        assert_eq!(res.record, local());
        assert!(res.push_local);
    }

    #[test]
    fn test_merge_unions_fields_preferring_local_values() {
        let res = resolve_conflict(&local(), &server(), ConflictStrategy::Merge).unwrap();
        assert_eq!(res.record.title.as_deref(), Some("local title"));
        assert_eq!(res.record.body.as_deref(), Some("server body"));
        assert_eq!(res.record.updated_at, "2026-01-02");
        assert!(res.push_local);
        assert_eq!(res.conflicting_fields, vec!["title".to_string()]);
    }

    #[test]
    fn test_strategy_parse_accepts_both_spellings() {
        assert_eq!(
            ConflictStrategy::parse("client_wins").unwrap(),
            ConflictStrategy::ClientWins
        );
        assert_eq!(
            ConflictStrategy::parse("Server-Wins").unwrap(),
            ConflictStrategy::ServerWins
        );
        assert!(ConflictStrategy::parse("coin-flip").is_err());
    }
}
