//! Namespace store and its snapshot format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::Value;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Binding that aliases the first loaded context payload.
pub const CONTEXT_ALIAS: &str = "context";

/// Binding that aliases `history_0`.
pub const HISTORY_ALIAS: &str = "history";

/// Variable bindings of one session, persisted across code blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    bindings: BTreeMap<String, Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.bindings.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.bindings.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Materialize a seed payload.
    ///
    /// A JSON object seeds one binding per key. Any other payload is bound
    /// to `context`.
    pub fn seed(&mut self, payload: &serde_json::Value) {
        match payload {
            serde_json::Value::Object(map) => {
                for (name, value) in map {
                    self.insert(name.clone(), Value::from_json(value));
                }
            }
            other => {
                self.insert(CONTEXT_ALIAS, Value::from_json(other));
            }
        }
    }

    /// Number of versioned `context_N` bindings present.
    pub fn context_count(&self) -> usize {
        self.versioned_count(CONTEXT_ALIAS)
    }

    /// Bind a context payload as `context_N`.
    ///
    /// With `index = None` the next free index is used. `context` always
    /// aliases `context_0`. Returns the index used.
    pub fn add_context(&mut self, payload: &serde_json::Value, index: Option<usize>) -> usize {
        self.add_versioned(CONTEXT_ALIAS, Value::from_json(payload), index)
    }

    /// Number of versioned `history_N` bindings present.
    pub fn history_count(&self) -> usize {
        self.versioned_count(HISTORY_ALIAS)
    }

    /// Bind a message history as `history_N`, with `history` aliasing
    /// `history_0`. The messages are copied. Returns the index used.
    pub fn add_history(&mut self, messages: &[serde_json::Value], index: Option<usize>) -> usize {
        let value = Value::List(messages.iter().map(Value::from_json).collect());
        self.add_versioned(HISTORY_ALIAS, value, index)
    }

    fn versioned_count(&self, prefix: &str) -> usize {
        (0..)
            .take_while(|i| self.contains(&format!("{}_{}", prefix, i)))
            .count()
    }

    fn add_versioned(&mut self, prefix: &str, value: Value, index: Option<usize>) -> usize {
        let index = index.unwrap_or_else(|| self.versioned_count(prefix));
        if index == 0 {
            self.insert(prefix, value.clone());
        }
        self.insert(format!("{}_{}", prefix, index), value);
        index
    }

    pub fn to_snapshot(&self) -> NamespaceSnapshot {
        NamespaceSnapshot {
            version: SNAPSHOT_VERSION,
            bindings: self.bindings.clone(),
        }
    }

    pub fn from_snapshot(snapshot: NamespaceSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Self {
            bindings: snapshot.bindings,
        })
    }

    /// Serialize into snapshot bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_snapshot())?)
    }

    /// Parse snapshot bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snapshot: NamespaceSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| Error::snapshot(format!("malformed snapshot: {}", e)))?;
        Self::from_snapshot(snapshot)
    }

    /// Write the snapshot to `path`, replacing any previous one atomically.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a snapshot from `path`. A missing file is an empty namespace.
    pub fn read_snapshot(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Self::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl FromIterator<(String, Value)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            bindings: iter.into_iter().collect(),
        }
    }
}

/// Serialized namespace exchanged between host and sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub version: u32,
    pub bindings: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableKey;
    use serde_json::json;

    #[test]
    fn test_seed_object_binds_each_key() {
        let mut ns = Namespace::new();
        ns.seed(&json!({"x": 1, "name": "ada"}));
        assert_eq!(ns.get("x"), Some(&Value::Int(1)));
        assert_eq!(ns.get("name"), Some(&Value::from("ada")));
        assert!(!ns.contains(CONTEXT_ALIAS));
    }

    #[test]
    fn test_seed_non_object_binds_context() {
        let mut ns = Namespace::new();
        ns.seed(&json!(["a", "b"]));
        assert_eq!(
            ns.get(CONTEXT_ALIAS),
            Some(&Value::List(vec![Value::from("a"), Value::from("b")]))
        );
    }

    #[test]
    fn test_add_context_versions_and_aliases() {
        let mut ns = Namespace::new();
        assert_eq!(ns.add_context(&json!("first"), None), 0);
        assert_eq!(ns.add_context(&json!("second"), None), 1);
        assert_eq!(ns.context_count(), 2);
        assert_eq!(ns.get("context"), Some(&Value::from("first")));
        assert_eq!(ns.get("context_1"), Some(&Value::from("second")));
    }

    #[test]
    fn test_add_history_versions_and_aliases() {
        let mut ns = Namespace::new();
        let mut messages = vec![json!({"role": "user", "content": "hi"})];
        assert_eq!(ns.add_history(&messages, None), 0);
        messages.push(json!({"role": "assistant", "content": "hello"}));
        assert_eq!(ns.add_history(&messages, None), 1);
        assert_eq!(ns.add_history(&messages, Some(4)), 4);

        assert_eq!(ns.history_count(), 2);
        assert_eq!(ns.context_count(), 0);
        let Some(Value::List(first)) = ns.get(HISTORY_ALIAS) else {
            panic!("expected history list");
        };
        assert_eq!(first.len(), 1);
        assert_eq!(ns.get("history_0"), ns.get(HISTORY_ALIAS));
        let Some(Value::List(second)) = ns.get("history_1") else {
            panic!("expected history list");
        };
        assert_eq!(second.len(), 2);
        assert!(ns.contains("history_4"));
    }

    #[test]
    fn test_keyed_tables_roundtrip() {
        let mut ns = Namespace::new();
        ns.insert(
            "mixed",
            Value::Table(vec![
                (TableKey::Int(1), Value::Int(10)),
                (TableKey::Int(2), Value::Int(20)),
                (TableKey::Str("n".into()), Value::Int(2)),
            ]),
        );
        ns.insert(
            "sparse",
            Value::Table(vec![
                (TableKey::Int(2), Value::from("b")),
                (TableKey::Int(5), Value::from("e")),
            ]),
        );
        let back = Namespace::decode(&ns.encode().unwrap()).unwrap();
        assert_eq!(back, ns);
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("namespace.json");

        let mut ns = Namespace::new();
        ns.insert("count", Value::Int(2));
        ns.insert("ratio", Value::Float(f64::NEG_INFINITY));
        ns.insert(
            "nested",
            Value::Map([("k".to_string(), Value::List(vec![Value::Nil, Value::Bool(true)]))].into()),
        );
        ns.write_snapshot(&path).unwrap();

        let back = Namespace::read_snapshot(&path).unwrap();
        assert_eq!(back, ns);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespace::read_snapshot(&dir.path().join("absent.json")).unwrap();
        assert!(ns.is_empty());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = Namespace::decode(br#"{"version": 99, "bindings": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }
}
