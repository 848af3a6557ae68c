//! Inventory management: hosts, groups, pattern resolution, and the
//! per-host variable view.
//!
//! The YAML document shape is `all: { hosts, children, vars }` where
//! children nest recursively. Host names may use `[01:05]` numeric ranges
//! (zero-padding preserved) and `{a,b,c}` alternation. Patterns passed to
//! [`Inventory::get_hosts`] are `:`-separated sub-patterns, each matched
//! glob-style against host names, addresses, and group names.

pub mod group;
pub mod host;

pub use group::Group;
pub use host::Host;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::vars::{merge_vars, VarMap};

/// Errors that can occur during inventory operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// I/O failure while loading.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid YAML.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document parsed but has the wrong shape.
    #[error("Invalid inventory document: {0}")]
    InvalidDocument(String),

    /// A host name was defined twice.
    #[error("duplicate host: {0}")]
    DuplicateHost(String),

    /// A group name was defined twice.
    #[error("duplicate group: {0}")]
    DuplicateGroup(String),

    /// A group references a missing host or group.
    #[error("group '{group}' references unknown {kind} '{name}'")]
    DanglingReference {
        /// Referencing group
        group: String,
        /// "host" or "group"
        kind: &'static str,
        /// The missing name
        name: String,
    },

    /// Group children form a cycle.
    #[error("circular group dependency detected at '{0}'")]
    CircularDependency(String),

    /// A requested host does not exist.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// A pattern could not be compiled.
    #[error("invalid host pattern: {0}")]
    InvalidPattern(String),
}

/// Result type for inventory operations.
pub type InventoryResult<T> = Result<T, InventoryError>;

static NUMERIC_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+):(\d+)\]").expect("valid regex"));
static ALTERNATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("valid regex"));

/// Expand `web[01:05].ex` numeric ranges (zero-padding preserved when the
/// start carries a leading zero) and `web{a,b,c}.ex` alternations.
pub fn expand_pattern(pattern: &str) -> InventoryResult<Vec<String>> {
    if let Some(caps) = NUMERIC_RANGE.captures(pattern) {
        let whole = caps.get(0).unwrap();
        let start_text = &caps[1];
        let start: u64 = start_text
            .parse()
            .map_err(|_| InventoryError::InvalidPattern(pattern.to_string()))?;
        let end: u64 = caps[2]
            .parse()
            .map_err(|_| InventoryError::InvalidPattern(pattern.to_string()))?;
        if start > end {
            return Err(InventoryError::InvalidPattern(pattern.to_string()));
        }
        let width = if start_text.starts_with('0') {
            start_text.len()
        } else {
            0
        };

        let mut out = Vec::new();
        for n in start..=end {
            let replacement = if width > 0 {
                format!("{:0width$}", n, width = width)
            } else {
                n.to_string()
            };
            let candidate = format!(
                "{}{}{}",
                &pattern[..whole.start()],
                replacement,
                &pattern[whole.end()..]
            );
            out.extend(expand_pattern(&candidate)?);
        }
        return Ok(out);
    }

    if let Some(caps) = ALTERNATION.captures(pattern) {
        let whole = caps.get(0).unwrap();
        let mut out = Vec::new();
        for choice in caps[1].split(',') {
            let candidate = format!(
                "{}{}{}",
                &pattern[..whole.start()],
                choice.trim(),
                &pattern[whole.end()..]
            );
            out.extend(expand_pattern(&candidate)?);
        }
        return Ok(out);
    }

    Ok(vec![pattern.to_string()])
}

/// The set of hosts and groups available to a run.
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    /// Create an empty inventory with the implicit `all` group.
    pub fn new() -> Self {
        let mut groups = IndexMap::new();
        groups.insert("all".to_string(), Group::all());
        Self {
            hosts: IndexMap::new(),
            groups,
        }
    }

    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> InventoryResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load from a YAML document of the `all: { hosts, children, vars }`
    /// shape.
    pub fn from_yaml(content: &str) -> InventoryResult<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)?;
        let mut inventory = Self::new();

        let root = doc
            .get("all")
            .ok_or_else(|| InventoryError::InvalidDocument("missing top-level 'all'".into()))?;
        inventory.load_group_body("all", root)?;
        inventory.validate()?;
        debug!(
            hosts = inventory.hosts.len(),
            groups = inventory.groups.len(),
            "inventory loaded"
        );
        Ok(inventory)
    }

    fn load_group_body(
        &mut self,
        group_name: &str,
        body: &serde_yaml::Value,
    ) -> InventoryResult<()> {
        if let Some(vars) = body.get("vars").and_then(|v| v.as_mapping()) {
            for (key, value) in vars {
                let key = yaml_key(key)?;
                let value = yaml_to_json(value)?;
                self.groups
                    .get_mut(group_name)
                    .expect("group exists")
                    .variables
                    .insert(key, value);
            }
        }

        if let Some(hosts) = body.get("hosts").and_then(|v| v.as_mapping()) {
            for (name, host_vars) in hosts {
                let name_pattern = yaml_key(name)?;
                for host_name in expand_pattern(&name_pattern)? {
                    let mut host = match self.hosts.shift_remove(&host_name) {
                        Some(existing) => existing,
                        None => Host::new(&host_name),
                    };
                    if let Some(vars) = host_vars.as_mapping() {
                        for (key, value) in vars {
                            host.set_variable(&yaml_key(key)?, yaml_to_json(value)?);
                        }
                    }
                    host.groups.push(group_name.to_string());
                    self.groups
                        .get_mut(group_name)
                        .expect("group exists")
                        .add_host(&host_name);
                    self.hosts.insert(host_name, host);
                }
            }
        }

        if let Some(children) = body.get("children").and_then(|v| v.as_mapping()) {
            for (child_name, child_body) in children {
                let child_name = yaml_key(child_name)?;
                if self.groups.contains_key(&child_name) {
                    return Err(InventoryError::DuplicateGroup(child_name));
                }
                self.groups
                    .insert(child_name.clone(), Group::new(&child_name));
                self.groups
                    .get_mut(group_name)
                    .expect("group exists")
                    .add_child(&child_name);
                self.load_group_body(&child_name, child_body)?;
            }
        }

        Ok(())
    }

    /// Check referential integrity and reject child cycles.
    pub fn validate(&self) -> InventoryResult<()> {
        for group in self.groups.values() {
            for host in &group.hosts {
                if !self.hosts.contains_key(host) {
                    return Err(InventoryError::DanglingReference {
                        group: group.name.clone(),
                        kind: "host",
                        name: host.clone(),
                    });
                }
            }
            for child in &group.children {
                if !self.groups.contains_key(child) {
                    return Err(InventoryError::DanglingReference {
                        group: group.name.clone(),
                        kind: "group",
                        name: child.clone(),
                    });
                }
            }
        }

        // Depth-first cycle detection over children.
        for name in self.groups.keys() {
            let mut stack = Vec::new();
            self.check_cycles(name, &mut stack)?;
        }
        Ok(())
    }

    fn check_cycles<'a>(
        &'a self,
        name: &'a str,
        stack: &mut Vec<&'a str>,
    ) -> InventoryResult<()> {
        if stack.contains(&name) {
            return Err(InventoryError::CircularDependency(name.to_string()));
        }
        stack.push(name);
        if let Some(group) = self.groups.get(name) {
            for child in &group.children {
                self.check_cycles(child, stack)?;
            }
        }
        stack.pop();
        Ok(())
    }

    /// Add a host programmatically.
    pub fn add_host(&mut self, host: Host) -> InventoryResult<()> {
        if self.hosts.contains_key(&host.name) {
            return Err(InventoryError::DuplicateHost(host.name));
        }
        for group in &host.groups {
            if let Some(g) = self.groups.get_mut(group) {
                g.add_host(&host.name);
            }
        }
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    /// Add a group programmatically.
    pub fn add_group(&mut self, group: Group) -> InventoryResult<()> {
        if self.groups.contains_key(&group.name) {
            return Err(InventoryError::DuplicateGroup(group.name));
        }
        self.groups.insert(group.name.clone(), group);
        Ok(())
    }

    /// Look up a host by name.
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Look up a group by name.
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Every host, in insertion order.
    pub fn all_hosts(&self) -> Vec<&Host> {
        self.hosts.values().collect()
    }

    /// A group's hosts including every reachable descendant's, dedup'd.
    pub fn group_hosts(&self, name: &str) -> Vec<&Host> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        self.collect_group_hosts(name, &mut names, &mut seen);
        names
            .into_iter()
            .filter_map(|n| self.hosts.get(&n))
            .collect()
    }

    fn collect_group_hosts(
        &self,
        name: &str,
        out: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        if name == "all" {
            for host in self.hosts.keys() {
                if !out.contains(host) {
                    out.push(host.clone());
                }
            }
            return;
        }
        if let Some(group) = self.groups.get(name) {
            for host in &group.hosts {
                if !out.contains(host) {
                    out.push(host.clone());
                }
            }
            for child in &group.children {
                self.collect_group_hosts(child, out, seen);
            }
        }
    }

    /// Resolve a pattern to hosts: empty or `*` means all; `:`-separated
    /// sub-patterns union; each sub-pattern glob-matches host names,
    /// addresses, and group names.
    pub fn get_hosts(&self, pattern: &str) -> InventoryResult<Vec<&Host>> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" || pattern == "all" {
            return Ok(self.all_hosts());
        }

        let mut names: Vec<String> = Vec::new();
        for sub in pattern.split(':').map(str::trim).filter(|s| !s.is_empty()) {
            let matcher = glob::Pattern::new(sub)
                .map_err(|_| InventoryError::InvalidPattern(sub.to_string()))?;

            let mut matched = false;
            for host in self.hosts.values() {
                if matcher.matches(&host.name) || matcher.matches(host.effective_address()) {
                    matched = true;
                    if !names.contains(&host.name) {
                        names.push(host.name.clone());
                    }
                }
            }
            for group_name in self.groups.keys() {
                if matcher.matches(group_name) {
                    matched = true;
                    for host in self.group_hosts(group_name) {
                        if !names.contains(&host.name) {
                            names.push(host.name.clone());
                        }
                    }
                }
            }
            if !matched {
                debug!(pattern = %sub, "pattern matched no hosts");
            }
        }

        Ok(names
            .iter()
            .filter_map(|n| self.hosts.get(n))
            .collect())
    }

    /// The host's effective variable view: group vars in group order, then
    /// host vars, then the `inventory_*`/`ansible_*` built-ins.
    pub fn host_vars(&self, name: &str) -> InventoryResult<VarMap> {
        let host = self
            .hosts
            .get(name)
            .ok_or_else(|| InventoryError::HostNotFound(name.to_string()))?;

        // Base layer: the implicit `all` group, then each membership group
        // with its ancestors applied outermost-first, then host vars.
        let mut merged = self
            .groups
            .get("all")
            .map(|g| g.variables.clone())
            .unwrap_or_default();
        for group_name in &host.groups {
            if group_name == "all" {
                continue;
            }
            let mut chain = Vec::new();
            self.ancestor_chain(group_name, &mut chain);
            chain.push(group_name.clone());
            for link in chain {
                if let Some(group) = self.groups.get(&link) {
                    merged = merge_vars(&merged, &group.variables);
                }
            }
        }
        merged = merge_vars(&merged, &host.variables);

        let short_name = host.name.split('.').next().unwrap_or(&host.name);
        merged.insert(
            "inventory_hostname".into(),
            JsonValue::String(host.name.clone()),
        );
        merged.insert(
            "inventory_hostname_short".into(),
            JsonValue::String(short_name.to_string()),
        );
        merged.insert(
            "ansible_host".into(),
            JsonValue::String(host.effective_address().to_string()),
        );
        merged.insert("ansible_port".into(), JsonValue::from(host.port));
        merged.insert("ansible_user".into(), JsonValue::String(host.user.clone()));
        Ok(merged)
    }
}

impl Inventory {
    /// Ancestors of `name` (excluding `all`), outermost first.
    fn ancestor_chain(&self, name: &str, acc: &mut Vec<String>) {
        let parents: Vec<String> = self
            .groups
            .iter()
            .filter(|(parent, group)| {
                parent.as_str() != "all" && group.children.iter().any(|c| c == name)
            })
            .map(|(parent, _)| parent.clone())
            .collect();
        for parent in parents {
            if !acc.contains(&parent) {
                self.ancestor_chain(&parent, acc);
                acc.push(parent);
            }
        }
    }
}

fn yaml_key(value: &serde_yaml::Value) -> InventoryResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value.as_u64().map(|n| n.to_string()))
        .ok_or_else(|| InventoryError::InvalidDocument(format!("non-string key: {:?}", value)))
}

fn yaml_to_json(value: &serde_yaml::Value) -> InventoryResult<JsonValue> {
    serde_json::to_value(value)
        .map_err(|e| InventoryError::InvalidDocument(format!("unrepresentable value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SAMPLE: &str = r#"
all:
  vars:
    dns: 1.1.1.1
  hosts:
    bastion:
      ansible_host: 203.0.113.1
  children:
    web:
      vars:
        role: web
        tuning: { workers: 4 }
      hosts:
        web[01:03].example.com:
          ansible_user: deploy
    db:
      vars:
        role: db
      hosts:
        db1.example.com: {}
    eu:
      children:
        frankfurt:
          hosts:
            fra{a,b}.example.com: {}
"#;

    #[test]
    fn test_expand_pattern_ranges() {
        assert_eq!(
            expand_pattern("h[01:03].x").unwrap(),
            vec!["h01.x", "h02.x", "h03.x"]
        );
        assert_eq!(
            expand_pattern("h[8:10].x").unwrap(),
            vec!["h8.x", "h9.x", "h10.x"]
        );
        assert_eq!(
            expand_pattern("h{a,b,c}.x").unwrap(),
            vec!["ha.x", "hb.x", "hc.x"]
        );
        assert_eq!(expand_pattern("plain").unwrap(), vec!["plain"]);
        assert!(expand_pattern("h[5:2].x").is_err());
    }

    #[test]
    fn test_load_sample() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        assert_eq!(inv.all_hosts().len(), 7);
        assert!(inv.get_host("web02.example.com").is_some());
        assert!(inv.get_host("frab.example.com").is_some());

        let web = inv.get_group("web").unwrap();
        assert_eq!(web.hosts.len(), 3);

        let host = inv.get_host("web01.example.com").unwrap();
        assert_eq!(host.user, "deploy");
        assert_eq!(
            inv.get_host("bastion").unwrap().effective_address(),
            "203.0.113.1"
        );
    }

    #[test]
    fn test_group_descent() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        let eu_hosts: Vec<&str> = inv.group_hosts("eu").iter().map(|h| h.name.as_str()).collect();
        assert_eq!(eu_hosts, vec!["fraa.example.com", "frab.example.com"]);
    }

    #[test]
    fn test_pattern_resolution() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();

        assert_eq!(inv.get_hosts("").unwrap().len(), 7);
        assert_eq!(inv.get_hosts("*").unwrap().len(), 7);
        assert_eq!(inv.get_hosts("web").unwrap().len(), 3);
        assert_eq!(inv.get_hosts("web*").unwrap().len(), 3);
        assert_eq!(inv.get_hosts("web:db").unwrap().len(), 4);
        assert_eq!(inv.get_hosts("web01.example.com").unwrap().len(), 1);
        // Matching by address.
        assert_eq!(inv.get_hosts("203.0.113.1").unwrap()[0].name, "bastion");
        // Dedup across sub-patterns.
        assert_eq!(inv.get_hosts("web:web01*").unwrap().len(), 3);
        assert_eq!(inv.get_hosts("nothing-matches").unwrap().len(), 0);
    }

    #[test]
    fn test_host_vars_view() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        let vars = inv.host_vars("web01.example.com").unwrap();

        assert_eq!(vars["dns"], json!("1.1.1.1"));
        assert_eq!(vars["role"], json!("web"));
        assert_eq!(vars["tuning"]["workers"], json!(4));
        assert_eq!(vars["inventory_hostname"], json!("web01.example.com"));
        assert_eq!(vars["inventory_hostname_short"], json!("web01"));
        assert_eq!(vars["ansible_user"], json!("deploy"));
    }

    #[test]
    fn test_host_vars_precedence_host_over_group() {
        let yaml = r#"
all:
  children:
    web:
      vars:
        env: group-level
      hosts:
        web01:
          env: host-level
"#;
        let inv = Inventory::from_yaml(yaml).unwrap();
        assert_eq!(inv.host_vars("web01").unwrap()["env"], json!("host-level"));
    }

    #[test]
    fn test_duplicate_and_dangling() {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("h1")).unwrap();
        assert!(matches!(
            inv.add_host(Host::new("h1")),
            Err(InventoryError::DuplicateHost(_))
        ));

        let mut group = Group::new("broken");
        group.add_host("missing");
        inv.add_group(group).unwrap();
        assert!(matches!(
            inv.validate(),
            Err(InventoryError::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let mut inv = Inventory::new();
        let mut a = Group::new("a");
        a.add_child("b");
        let mut b = Group::new("b");
        b.add_child("a");
        inv.add_group(a).unwrap();
        inv.add_group(b).unwrap();
        assert!(matches!(
            inv.validate(),
            Err(InventoryError::CircularDependency(_))
        ));
    }
}
