//! Group representation.

use serde::{Deserialize, Serialize};

use crate::vars::VarMap;

/// A named collection of hosts, possibly with child groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    /// Group name (unique)
    pub name: String,
    /// Direct member host names
    pub hosts: Vec<String>,
    /// Child group names; cycles are rejected at load
    pub children: Vec<String>,
    /// Group variables
    pub variables: VarMap,
}

impl Group {
    /// Create a group named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The implicit group containing every host.
    pub fn all() -> Self {
        Self::new("all")
    }

    /// Add a member host name, once.
    pub fn add_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    /// Add a child group name, once.
    pub fn add_child(&mut self, child: impl Into<String>) {
        let child = child.into();
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_is_deduplicated() {
        let mut group = Group::new("web");
        group.add_host("web01");
        group.add_host("web01");
        group.add_child("eu");
        group.add_child("eu");
        assert_eq!(group.hosts, vec!["web01"]);
        assert_eq!(group.children, vec!["eu"]);
    }
}
