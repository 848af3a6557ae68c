//! Layered variable and fact storage.
//!
//! The store keeps two layers: facts (gathered from hosts, lower
//! precedence) and variables (user supplied, higher precedence). Readers
//! take merged snapshots; no lock is held across awaits.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

/// Flat variable map used throughout the engine.
pub type VarMap = IndexMap<String, JsonValue>;

/// Thread-safe layered variable store.
#[derive(Debug, Default)]
pub struct VariableStore {
    inner: RwLock<Layers>,
}

#[derive(Debug, Default)]
struct Layers {
    facts: VarMap,
    vars: VarMap,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key: the variables layer wins over facts.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let layers = self.inner.read();
        layers
            .vars
            .get(key)
            .or_else(|| layers.facts.get(key))
            .cloned()
    }

    /// Snapshot of the merged view, variables overriding facts.
    pub fn get_all(&self) -> VarMap {
        let layers = self.inner.read();
        let mut merged = layers.facts.clone();
        for (k, v) in &layers.vars {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Set a single variable.
    pub fn set(&self, key: impl Into<String>, value: JsonValue) {
        self.inner.write().vars.insert(key.into(), value);
    }

    /// Bulk-write into the variables layer.
    pub fn set_vars(&self, vars: VarMap) {
        let mut layers = self.inner.write();
        for (k, v) in vars {
            layers.vars.insert(k, v);
        }
    }

    /// Set a single fact.
    pub fn set_fact(&self, key: impl Into<String>, value: JsonValue) {
        self.inner.write().facts.insert(key.into(), value);
    }

    /// Bulk-write into the facts layer.
    pub fn set_facts(&self, facts: VarMap) {
        let mut layers = self.inner.write();
        for (k, v) in facts {
            layers.facts.insert(k, v);
        }
    }

    /// Store a registered task result; registers live in the variables
    /// layer for the rest of the run.
    pub fn register(&self, name: impl Into<String>, value: JsonValue) {
        self.set(name, value);
    }

    /// Whether the key resolves in either layer.
    pub fn contains(&self, key: &str) -> bool {
        let layers = self.inner.read();
        layers.vars.contains_key(key) || layers.facts.contains_key(key)
    }

    /// Remove every entry from both layers.
    pub fn clear(&self) {
        let mut layers = self.inner.write();
        layers.vars.clear();
        layers.facts.clear();
    }
}

/// Deep merge: for keys present in both whose values are both maps, the
/// result is the recursive merge; otherwise `overlay`'s value wins.
/// Sequences are replaced, not concatenated.
pub fn merge_vars(base: &VarMap, overlay: &VarMap) -> VarMap {
    let mut out = base.clone();
    for (key, value) in overlay {
        match (out.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_json_objects(existing, incoming);
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn merge_json_objects(
    base: &mut serde_json::Map<String, JsonValue>,
    overlay: &serde_json::Map<String, JsonValue>,
) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_json_objects(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Resolve a dot-separated path against a variable map; `a.b[2]` indexes
/// sequences with a nonnegative integer.
pub fn lookup_path(vars: &VarMap, path: &str) -> Option<JsonValue> {
    let mut current: Option<JsonValue> = None;
    for segment in path.split('.') {
        let (name, indices) = parse_segment(segment)?;
        let next = match &current {
            None => vars.get(name).cloned()?,
            Some(JsonValue::Object(map)) => map.get(name).cloned()?,
            _ => return None,
        };
        let mut value = next;
        for idx in indices {
            value = match value {
                JsonValue::Array(items) => items.get(idx)?.clone(),
                _ => return None,
            };
        }
        current = Some(value);
    }
    current
}

/// Parse `name[1][2]` into the name and its index chain.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let name = &segment[..pos];
            let mut indices = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']')?;
                indices.push(stripped[..end].trim().parse::<usize>().ok()?);
                rest = &stripped[end + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
            Some((name, indices))
        }
    }
}

/// Deep merge two JSON values; non-object pairs resolve to `overlay`.
pub fn merge_values(base: &JsonValue, overlay: &JsonValue) -> JsonValue {
    match (base, overlay) {
        (JsonValue::Object(b), JsonValue::Object(o)) => {
            let mut merged = b.clone();
            merge_json_objects(&mut merged, o);
            JsonValue::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_vars_override_facts() {
        let store = VariableStore::new();
        store.set_fact("env", json!("gathered"));
        store.set("env", json!("explicit"));

        assert_eq!(store.get("env"), Some(json!("explicit")));
        assert_eq!(store.get_all().get("env"), Some(&json!("explicit")));
    }

    #[test]
    fn test_facts_visible_when_unshadowed() {
        let store = VariableStore::new();
        store.set_facts(
            [("ansible_os_family".to_string(), json!("Debian"))]
                .into_iter()
                .collect(),
        );
        assert_eq!(store.get("ansible_os_family"), Some(json!("Debian")));
        assert!(store.contains("ansible_os_family"));
        assert!(!store.contains("missing"));
    }

    #[test]
    fn test_register_lives_in_vars_layer() {
        let store = VariableStore::new();
        store.register("install_out", json!({"rc": 0}));
        assert_eq!(store.get("install_out").unwrap()["rc"], json!(0));
    }

    #[test]
    fn test_merge_vars_deep() {
        let base: VarMap = [
            ("a".to_string(), json!(1)),
            (
                "nested".to_string(),
                json!({"x": 1, "inner": {"keep": true, "swap": 1}}),
            ),
            ("list".to_string(), json!([1, 2, 3])),
        ]
        .into_iter()
        .collect();

        let overlay: VarMap = [
            (
                "nested".to_string(),
                json!({"y": 2, "inner": {"swap": 2}}),
            ),
            ("list".to_string(), json!([9])),
        ]
        .into_iter()
        .collect();

        let merged = merge_vars(&base, &overlay);
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["nested"]["x"], json!(1));
        assert_eq!(merged["nested"]["y"], json!(2));
        assert_eq!(merged["nested"]["inner"]["keep"], json!(true));
        assert_eq!(merged["nested"]["inner"]["swap"], json!(2));
        // Sequences are replaced wholesale.
        assert_eq!(merged["list"], json!([9]));
    }

    #[test]
    fn test_merge_scalar_wins() {
        let base: VarMap = [("k".to_string(), json!({"deep": 1}))].into_iter().collect();
        let overlay: VarMap = [("k".to_string(), json!("flat"))].into_iter().collect();
        assert_eq!(merge_vars(&base, &overlay)["k"], json!("flat"));
    }
}
