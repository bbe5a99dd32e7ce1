//! Keyed blob store.
//!
//! The daemon keeps a single process-wide store of serializable values
//! keyed by string; services modules put their namespaces under it (e.g.
//! the `services` key). The store is opened at startup, flushed on
//! mutation-heavy paths at shutdown, and accessed only from the core task,
//! so reads and writes are serialized by construction.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug)]
pub struct Storage {
    path: Option<PathBuf>,
    root: Map<String, Value>,
    dirty: bool,
}

impl Storage {
    /// Open the store at `path`, creating it on first use. A missing or
    /// unreadable file starts empty; it will be written back on flush.
    pub fn open(path: &Path) -> Storage {
        let root = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(path = %path.display(), "storage file is not a JSON object, starting empty");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Storage {
            path: Some(path.to_path_buf()),
            root,
            dirty: false,
        }
    }

    /// An in-memory store that never touches disk. Used by tests and when
    /// persistence is disabled.
    pub fn ephemeral() -> Storage {
        Storage {
            path: None,
            root: Map::new(),
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.dirty = true;
        self.root.get_mut(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.dirty = true;
        self.root.insert(key.to_string(), value);
    }

    /// Fetch `key` as a mutable object, inserting an empty object if the
    /// key is missing or holds a non-object.
    pub fn entry_object(&mut self, key: &str) -> &mut Map<String, Value> {
        self.dirty = true;
        let slot = self
            .root
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        slot.as_object_mut().expect("just ensured object")
    }

    /// Write the store back to disk if anything changed.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return;
        };
        match serde_json::to_string_pretty(&Value::Object(self.root.clone())) {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(path, serialized) {
                    warn!(path = %path.display(), error = %e, "failed to flush storage");
                } else {
                    self.dirty = false;
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize storage"),
        }
    }
}

/// Drill into a nested object path, creating intermediate objects.
pub fn ensure_object_path<'a>(
    map: &'a mut Map<String, Value>,
    path: &[&str],
) -> &'a mut Map<String, Value> {
    let mut current = map;
    for key in path {
        let slot = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("just ensured object");
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        let mut store = Storage::open(&path);
        store.set("services", json!({"channel": {"data": {}}}));
        store.flush();

        let reopened = Storage::open(&path);
        assert_eq!(
            reopened.get("services"),
            Some(&json!({"channel": {"data": {}}}))
        );
    }

    #[test]
    fn ephemeral_never_writes() {
        let mut store = Storage::ephemeral();
        store.set("k", json!(1));
        store.flush();
        assert_eq!(store.get("k"), Some(&json!(1)));
    }

    #[test]
    fn entry_object_replaces_non_objects() {
        let mut store = Storage::ephemeral();
        store.set("k", json!("scalar"));
        store.entry_object("k").insert("a".into(), json!(true));
        assert_eq!(store.get("k"), Some(&json!({"a": true})));
    }

    #[test]
    fn nested_path_creation() {
        let mut store = Storage::ephemeral();
        let obj = store.entry_object("services");
        let inner = ensure_object_path(obj, &["channel", "index", "regname"]);
        inner.insert("acct".into(), json!(["#chan"]));
        assert_eq!(
            store.get("services"),
            Some(&json!({"channel": {"index": {"regname": {"acct": ["#chan"]}}}}))
        );
    }
}
