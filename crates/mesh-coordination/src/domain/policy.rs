//! Protection policy state and the deep merge used for policy updates and
//! `update_config` commands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mapping of policy keys to values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet(Map<String, Value>);

impl PolicySet {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `incoming` into this set; see [`deep_merge`].
    pub fn merge(&mut self, incoming: &PolicySet) {
        deep_merge(&mut self.0, &incoming.0);
    }
}

impl From<Map<String, Value>> for PolicySet {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Merge `incoming` into `target`.
///
/// For a key present on both sides: recurse if both values are objects,
/// otherwise the incoming value wins. Keys only in `target` are kept.
pub fn deep_merge(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(update)) => deep_merge(existing, update),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
