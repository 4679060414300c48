//! Group Module
//!
//! Cluster groups: named subsets of nodes sharing configuration and a
//! dedicated messaging channel. Group configuration is reconciled between
//! each node's local store and the replicated group configuration map;
//! membership is derived from the replicated node-to-groups map.

mod snapshot;
mod reconciler;
mod registry;
mod synchronizer;
mod manager;

pub use snapshot::ConfigSnapshot;
pub use reconciler::{merge_updates, overlay_updates, ConfigReconciler, GroupUpdates, PullOutcome};
pub use registry::MembershipRegistry;
pub use synchronizer::Synchronizer;
pub use manager::{Collaborators, GroupManager};

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use crate::cluster::Node;
use crate::error::{Error, Result};

/// Default PID of the replicated group configuration
pub const GROUPS_PID: &str = "wolfgroup.groups";

/// Default PID of this node's own group memberships
pub const NODE_PID: &str = "wolfgroup.node";

/// Reserved property holding comma-separated group names
pub const GROUPS_KEY: &str = "groups";

/// The implicit group every node can see
pub const DEFAULT_GROUP: &str = "default";

/// Local-only property prefixes
pub const RESERVED_PREFIXES: &[&str] = &["felix.", "service."];

/// Property signalling that a group was added to or removed from the cluster
pub const CHANGE_MARKER: &str = ".change";

/// `CHANGE_MARKER` value for an added group
pub const MARKER_ADDED: &str = "added";

/// `CHANGE_MARKER` value for a removed group
pub const MARKER_REMOVED: &str = "removed";

/// Settings shared by the reconciler, registry and manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    /// PID of the replicated group configuration
    pub pid: String,
    /// PID holding this node's memberships
    pub node_pid: String,
    /// Reserved group list property
    pub groups_key: String,
    /// Name of the implicit group
    pub default_group: String,
    /// Local-only property prefixes
    pub reserved_prefixes: Vec<String>,
    /// Request exclusive group endpoints from the transport
    pub exclusive_transport: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            pid: GROUPS_PID.to_string(),
            node_pid: NODE_PID.to_string(),
            groups_key: GROUPS_KEY.to_string(),
            default_group: DEFAULT_GROUP.to_string(),
            reserved_prefixes: RESERVED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            exclusive_transport: true,
        }
    }
}

impl GroupSettings {
    /// Whether `key` is a local-only property
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved_prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// A named group and the nodes currently in it.
///
/// Groups are computed views over replicated state, rebuilt on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub members: BTreeSet<Node>,
}

impl Group {
    /// Create a group with no members
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    /// Whether `node` is a member
    pub fn contains(&self, node: &Node) -> bool {
        self.members.contains(node)
    }
}

/// Membership state of a group as seen by the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    NotMember,
    /// Join started; stays here if a join step failed and must be retried
    Joining,
    Member,
    Leaving,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupState::NotMember => write!(f, "NOT_MEMBER"),
            GroupState::Joining => write!(f, "JOINING"),
            GroupState::Member => write!(f, "MEMBER"),
            GroupState::Leaving => write!(f, "LEAVING"),
        }
    }
}

/// Parse a comma-separated group list, ignoring blanks
pub fn parse_group_names(value: Option<&str>) -> BTreeSet<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Render a group list in its stored form
pub fn format_group_names(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Group names become channel names and property prefixes, so they cannot
/// contain the list or namespace separators.
pub fn validate_group_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.trim() != name || name.contains(',') || name.contains('.') {
        return Err(Error::InvalidGroupName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_list() {
        let names = parse_group_names(Some("ops, default,,web "));
        assert_eq!(format_group_names(&names), "default,ops,web");
        assert!(parse_group_names(None).is_empty());
        assert!(parse_group_names(Some("")).is_empty());
    }

    #[test]
    fn test_validate_group_name() {
        assert!(validate_group_name("ops").is_ok());
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name("a,b").is_err());
        assert!(validate_group_name("a.b").is_err());
        assert!(validate_group_name(" ops").is_err());
    }

    #[test]
    fn test_reserved_prefixes() {
        let settings = GroupSettings::default();
        assert!(settings.is_reserved("felix.fileinstall.filename"));
        assert!(settings.is_reserved("service.pid"));
        assert!(!settings.is_reserved("default.timeout"));
    }
}
