//! Group Configuration Reconciler
//!
//! Translates between a node's local configuration dictionary and the
//! replicated group configuration map. Only changed keys travel in either
//! direction, so concurrent remote edits are never overwritten by stale
//! local values.
//!
//! Local keys map onto replicated entries as follows:
//!
//! - `<group>.<property> = value` goes into entry `<group>` as
//!   `{"<group>.<property>": "value"}`
//! - a change of the reserved group list goes into entry `<group>` as
//!   `{".change": "added"}` or `{".change": "removed"}` for every group that
//!   appeared in or disappeared from the list

use std::collections::BTreeMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{
    format_group_names, parse_group_names, ConfigSnapshot, GroupSettings, CHANGE_MARKER,
    MARKER_ADDED, MARKER_REMOVED,
};
use crate::cluster::{ClusterView, GroupConfigStore, GROUPS_CONFIG_LOCK};
use crate::error::{Error, Result};
use crate::local::Properties;

/// Partial updates staged for the replicated map, keyed by group
pub type GroupUpdates = BTreeMap<String, Properties>;

/// Local keys modified by a pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub changed_keys: Vec<String>,
}

impl PullOutcome {
    /// Whether the local configuration was modified
    pub fn changed(&self) -> bool {
        !self.changed_keys.is_empty()
    }
}

/// Bidirectional diff/merge between local and replicated configuration
pub struct ConfigReconciler {
    settings: GroupSettings,
    snapshot: Mutex<ConfigSnapshot>,
}

impl ConfigReconciler {
    /// Create a reconciler with an empty baseline
    pub fn new(settings: GroupSettings) -> Self {
        Self {
            settings,
            snapshot: Mutex::new(ConfigSnapshot::new()),
        }
    }

    /// Replace the baseline with the current local configuration
    pub async fn seed(&self, properties: &Properties) {
        self.snapshot.lock().await.reset(properties);
    }

    /// Copy of the current baseline
    pub async fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Stage the local changes since the last push.
    ///
    /// Every key is recorded in the baseline afterwards, whether staged or not.
    pub async fn push(&self, properties: &Properties) -> GroupUpdates {
        let mut snapshot = self.snapshot.lock().await;
        let mut updates = GroupUpdates::new();

        for (key, value) in properties {
            if !self.settings.is_reserved(key) && !snapshot.is_unchanged(key, value) {
                if *key == self.settings.groups_key {
                    let previous = parse_group_names(snapshot.get(key));
                    let current = parse_group_names(Some(value));

                    for added in current.difference(&previous) {
                        updates
                            .entry(added.clone())
                            .or_default()
                            .insert(CHANGE_MARKER.to_string(), MARKER_ADDED.to_string());
                    }
                    for removed in previous.difference(&current) {
                        updates
                            .entry(removed.clone())
                            .or_default()
                            .insert(CHANGE_MARKER.to_string(), MARKER_REMOVED.to_string());
                    }
                } else {
                    updates
                        .entry(group_key(key).to_string())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
            }
            snapshot.record(key, value);
        }

        if !updates.is_empty() {
            tracing::debug!("Staged configuration updates for groups {:?}", updates.keys());
        }
        updates
    }

    /// Merge one replicated entry into `properties`.
    ///
    /// Values and markers that match the baseline were already synchronized
    /// and are skipped, so a late echo of this node's own push cannot undo a
    /// newer local edit. The baseline is not touched; call
    /// [`ConfigReconciler::commit`] once the modified properties have been
    /// persisted.
    pub async fn pull(&self, key: &str, value: Option<&Value>, properties: &mut Properties) -> PullOutcome {
        let snapshot = self.snapshot.lock().await;
        let mut outcome = PullOutcome::default();

        let entries = match value {
            Some(Value::Object(entries)) => entries,
            Some(other) => {
                let err = Error::MalformedEntry {
                    key: key.to_string(),
                    reason: format!("expected an object, got {}", other),
                };
                tracing::debug!("Ignoring group configuration: {}", err);
                return outcome;
            }
            None => {
                tracing::trace!("Ignoring group configuration {} without value", key);
                return outcome;
            }
        };

        for (property, incoming) in entries {
            if property == CHANGE_MARKER {
                let groups_key = &self.settings.groups_key;
                let mut groups = parse_group_names(properties.get(groups_key).map(String::as_str));
                let synced = parse_group_names(snapshot.get(groups_key)).contains(key);
                let applied = match incoming.as_str() {
                    Some(MARKER_ADDED) if !synced => groups.insert(key.to_string()),
                    Some(MARKER_REMOVED) if synced => groups.remove(key),
                    Some(MARKER_ADDED) | Some(MARKER_REMOVED) => false,
                    _ => {
                        tracing::debug!("Ignoring unknown change marker on {}: {}", key, incoming);
                        false
                    }
                };

                if applied {
                    tracing::debug!(
                        "Group {} has been {} by the cluster",
                        key,
                        incoming.as_str().unwrap_or_default()
                    );
                    properties.insert(groups_key.clone(), format_group_names(&groups));
                    outcome.changed_keys.push(groups_key.clone());
                }
            } else if self.settings.is_reserved(property) {
                tracing::debug!("Ignoring local-only property {} from cluster", property);
            } else if let Some(incoming) = property_value(incoming) {
                if !snapshot.is_unchanged(property, &incoming)
                    && properties.get(property) != Some(&incoming)
                {
                    tracing::debug!(
                        "Group {} configuration from cluster: {} = {}",
                        key,
                        property,
                        incoming
                    );
                    properties.insert(property.clone(), incoming);
                    outcome.changed_keys.push(property.clone());
                }
            }
        }

        outcome
    }

    /// Record the keys modified by a persisted pull in the baseline, so the
    /// resulting local change is not sent back to the cluster
    pub async fn commit(&self, properties: &Properties, outcome: &PullOutcome) {
        let mut snapshot = self.snapshot.lock().await;
        for key in &outcome.changed_keys {
            if let Some(value) = properties.get(key) {
                snapshot.record(key, value);
            }
        }
    }
}

/// Group a property belongs to: the text before the first `.`
fn group_key(key: &str) -> &str {
    key.split_once('.').map(|(group, _)| group).unwrap_or(key)
}

fn property_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Overlay staged updates onto the replicated map, one group at a time.
///
/// Existing properties of a group are kept; only staged properties are
/// replaced. Returns the number of entries written.
pub async fn merge_updates(
    store: &GroupConfigStore,
    cluster: &dyn ClusterView,
    updates: GroupUpdates,
) -> Result<usize> {
    if updates.is_empty() {
        return Ok(0);
    }

    let _guard = cluster.lock(GROUPS_CONFIG_LOCK).await?;
    overlay_updates(store, updates).await
}

/// Overlay staged updates onto the replicated map without locking.
///
/// Caller must hold [`GROUPS_CONFIG_LOCK`].
pub async fn overlay_updates(store: &GroupConfigStore, updates: GroupUpdates) -> Result<usize> {
    let mut written = 0;

    for (group, properties) in updates {
        let current = store.get(&group).await?;
        let mut merged = match &current {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for (key, value) in properties {
            merged.insert(key, Value::String(value));
        }

        let merged = Value::Object(merged);
        if current.as_ref() != Some(&merged) {
            tracing::debug!("Sending updates to cluster: {} = {}", group, merged);
            store.put(group, merged).await?;
            written += 1;
        }
    }

    Ok(written)
}
