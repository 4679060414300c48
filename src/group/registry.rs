//! Membership Registry
//!
//! Computes `Group` views from the locally known group names and the
//! replicated node-to-groups map. Views are rebuilt on every call; the cost
//! is O(nodes × groups), which is fine for membership queries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{parse_group_names, Group, GroupSettings};
use crate::cluster::{Node, NodeGroupsStore};
use crate::error::Result;
use crate::local::LocalConfigStore;

/// Answers "which groups exist" and "who is in group G"
pub struct MembershipRegistry {
    settings: GroupSettings,
    local_config: Arc<dyn LocalConfigStore>,
    node_groups: Arc<NodeGroupsStore>,
}

impl MembershipRegistry {
    pub fn new(
        settings: GroupSettings,
        local_config: Arc<dyn LocalConfigStore>,
        node_groups: Arc<NodeGroupsStore>,
    ) -> Self {
        Self {
            settings,
            local_config,
            node_groups,
        }
    }

    /// Group names known locally, always including the default group
    pub async fn group_names(&self) -> Result<BTreeSet<String>> {
        let properties = self.local_config.read(&self.settings.pid).await?;
        let mut names = parse_group_names(
            properties
                .as_ref()
                .and_then(|p| p.get(&self.settings.groups_key))
                .map(String::as_str),
        );
        names.insert(self.settings.default_group.clone());
        Ok(names)
    }

    /// Every known group with its members, keyed by name
    pub async fn list_groups(&self) -> Result<BTreeMap<String, Group>> {
        let names = self.group_names().await?;
        let memberships = self.node_groups.entries().await?;

        Ok(names
            .into_iter()
            .map(|name| {
                let members = memberships
                    .iter()
                    .filter(|(_, groups)| groups.contains(&name))
                    .map(|(node, _)| node.clone())
                    .collect();
                (name.clone(), Group { name, members })
            })
            .collect())
    }

    /// Known groups that `node` has joined
    pub async fn list_groups_for(&self, node: &Node) -> Result<Vec<Group>> {
        let joined = match self.node_groups.get(node).await? {
            Some(joined) => joined,
            None => return Ok(Vec::new()),
        };

        Ok(self
            .list_groups()
            .await?
            .into_values()
            .filter(|group| joined.contains(&group.name))
            .collect())
    }

    /// Every known group
    pub async fn list_all_groups(&self) -> Result<Vec<Group>> {
        Ok(self.list_groups().await?.into_values().collect())
    }

    /// Look up a group by name
    pub async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        Ok(self.list_groups().await?.remove(name))
    }

    /// Names of the known groups whose members include `node`
    pub async fn list_group_names_for(&self, node: &Node) -> Result<BTreeSet<String>> {
        Ok(self
            .list_groups()
            .await?
            .into_values()
            .filter(|group| group.contains(node))
            .map(|group| group.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryStore, ReplicatedStore};
    use crate::local::{MemoryConfigStore, Properties};

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    async fn setup(groups: Option<&str>) -> (MembershipRegistry, MemoryStore<Node, BTreeSet<String>>) {
        let settings = GroupSettings::default();
        let local = match groups {
            Some(groups) => {
                let mut props = Properties::new();
                props.insert("groups".to_string(), groups.to_string());
                MemoryConfigStore::with_properties(&settings.pid, props)
            }
            None => MemoryConfigStore::new(),
        };
        let node_groups: MemoryStore<Node, BTreeSet<String>> = MemoryStore::new("groups", 16);
        let registry = MembershipRegistry::new(settings, Arc::new(local), Arc::new(node_groups.clone()));
        (registry, node_groups)
    }

    #[tokio::test]
    async fn test_default_group_always_present() {
        let (registry, _) = setup(None).await;
        let groups = registry.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups["default"].members.is_empty());

        let (registry, _) = setup(Some("")).await;
        assert!(registry.list_groups().await.unwrap().contains_key("default"));

        let (registry, _) = setup(Some("ops")).await;
        let keys: Vec<_> = registry.list_groups().await.unwrap().into_keys().collect();
        assert_eq!(keys, vec!["default", "ops"]);
    }

    #[tokio::test]
    async fn test_members_from_replicated_map() {
        let (registry, node_groups) = setup(Some("default,ops,web")).await;
        let a = Node::new("a", "127.0.0.1:1");
        let b = Node::new("b", "127.0.0.1:2");
        let c = Node::new("c", "127.0.0.1:3");
        node_groups.put(a.clone(), names(&["default", "ops"])).await.unwrap();
        node_groups.put(b.clone(), names(&["ops", "unknown"])).await.unwrap();

        let groups = registry.list_groups().await.unwrap();
        assert_eq!(groups["ops"].members, BTreeSet::from([a.clone(), b.clone()]));
        assert_eq!(groups["default"].members, BTreeSet::from([a.clone()]));
        assert!(groups["web"].members.is_empty());
        // Groups not known locally are not materialized
        assert!(!groups.contains_key("unknown"));

        let for_b: Vec<_> = registry
            .list_groups_for(&b)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(for_b, vec!["ops"]);
        assert!(registry.list_groups_for(&c).await.unwrap().is_empty());

        assert_eq!(registry.list_group_names_for(&a).await.unwrap(), names(&["default", "ops"]));
        assert_eq!(registry.list_all_groups().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_missing_group() {
        let (registry, _) = setup(Some("ops")).await;
        assert!(registry.find_group_by_name("ops").await.unwrap().is_some());
        assert!(registry.find_group_by_name("nope").await.unwrap().is_none());
    }
}
