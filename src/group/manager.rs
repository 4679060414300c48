//! Group Manager
//!
//! Joins and leaves groups on behalf of the local node and keeps the local
//! group configuration convergent with the replicated copy.
//!
//! Two listener tasks drive reconciliation once [`GroupManager::init`] has
//! run: local configuration changes are pushed to the replicated map, and
//! every replicated entry change (added, updated, removed or evicted) is
//! pulled into the local configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::reconciler::{merge_updates, overlay_updates, ConfigReconciler, PullOutcome};
use super::registry::MembershipRegistry;
use super::synchronizer::Synchronizer;
use super::{
    format_group_names, parse_group_names, validate_group_name, Group, GroupSettings, GroupState,
};
use crate::cluster::{ClusterView, EntryEvent, GroupConfigStore, Node, NodeGroupsStore, GROUPS_CONFIG_LOCK};
use crate::error::{Error, Result};
use crate::local::{ConfigEvent, ConfigEventKind, LocalConfigStore, Properties};
use crate::transport::{EventConsumer, EventProducer, EventTransportFactory};

/// External services the manager works against
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterView>,
    pub group_config: Arc<GroupConfigStore>,
    pub node_groups: Arc<NodeGroupsStore>,
    pub local_config: Arc<dyn LocalConfigStore>,
    pub transport: Arc<dyn EventTransportFactory>,
}

/// Producer and consumer of one group channel
#[derive(Default)]
struct GroupTransport {
    producer: Option<Arc<dyn EventProducer>>,
    consumer: Option<Arc<dyn EventConsumer>>,
}

/// Group lifecycle coordinator for the local node
pub struct GroupManager {
    settings: GroupSettings,
    cluster: Arc<dyn ClusterView>,
    group_config: Arc<GroupConfigStore>,
    node_groups: Arc<NodeGroupsStore>,
    local_config: Arc<dyn LocalConfigStore>,
    transport_factory: Arc<dyn EventTransportFactory>,
    reconciler: ConfigReconciler,
    registry: MembershipRegistry,
    synchronizers: RwLock<Vec<Arc<dyn Synchronizer>>>,
    transports: Mutex<HashMap<String, GroupTransport>>,
    states: RwLock<HashMap<String, GroupState>>,
    /// Serializes read-modify-write cycles on local configuration
    config_lock: Mutex<()>,
    /// Serializes updates of this node's entry in the node-to-groups map
    membership_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: RwLock<bool>,
}

impl GroupManager {
    /// Create a manager; call [`GroupManager::init`] before use
    pub fn new(settings: GroupSettings, collaborators: Collaborators) -> Arc<Self> {
        let registry = MembershipRegistry::new(
            settings.clone(),
            Arc::clone(&collaborators.local_config),
            Arc::clone(&collaborators.node_groups),
        );

        Arc::new(Self {
            reconciler: ConfigReconciler::new(settings.clone()),
            registry,
            settings,
            cluster: collaborators.cluster,
            group_config: collaborators.group_config,
            node_groups: collaborators.node_groups,
            local_config: collaborators.local_config,
            transport_factory: collaborators.transport,
            synchronizers: RwLock::new(Vec::new()),
            transports: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            config_lock: Mutex::new(()),
            membership_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            running: RwLock::new(false),
        })
    }

    /// The local node
    pub fn node(&self) -> Node {
        self.cluster.local_node()
    }

    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    /// Register a synchronizer invoked on every join
    pub async fn add_synchronizer(&self, synchronizer: Arc<dyn Synchronizer>) {
        tracing::debug!("Registered synchronizer {}", synchronizer.name());
        self.synchronizers.write().await.push(synchronizer);
    }

    /// Unregister a synchronizer by name
    pub async fn remove_synchronizer(&self, name: &str) -> bool {
        let mut synchronizers = self.synchronizers.write().await;
        let before = synchronizers.len();
        synchronizers.retain(|s| s.name() != name);
        synchronizers.len() != before
    }

    /// Bring the local configuration and the cluster in line, publish this
    /// node's memberships and start the listener tasks.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        let node = self.node();
        tracing::info!("Initializing group manager on node {}", node);

        // Subscribe first so no change between the initial sync and the
        // listener start is lost
        let replicated_events = self.group_config.subscribe();
        let local_events = self.local_config.subscribe();

        // Emptiness is checked under the cluster lock so only one node seeds
        // the map
        let bootstrapped = {
            let _cluster_guard = self.cluster.lock(GROUPS_CONFIG_LOCK).await?;
            if self.group_config.is_empty().await? {
                tracing::info!("Initializing cluster group configuration from local configuration");
                let _guard = self.config_lock.lock().await;
                let properties = self.read_local(&self.settings.pid).await?;
                let updates = self.reconciler.push(&properties).await;
                overlay_updates(self.group_config.as_ref(), updates).await?;
                true
            } else {
                false
            }
        };

        if !bootstrapped {
            let properties = self.read_local(&self.settings.pid).await?;
            self.reconciler.seed(&properties).await;
            self.resync().await?;
        }

        let memberships = self.persisted_memberships().await?;
        {
            let _guard = self.membership_lock.lock().await;
            self.node_groups.put(node.clone(), memberships.clone()).await?;
        }
        for name in &memberships {
            if let Err(e) = self.activate_transport(name).await {
                tracing::warn!("Group {} messaging unavailable: {}", name, e);
            }
            self.set_state(name, GroupState::Member).await;
        }
        tracing::info!("Node {} is a member of {:?}", node.id, memberships);

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_local_listener(local_events));
        tasks.push(self.spawn_replicated_listener(replicated_events));

        *running = true;
        Ok(())
    }

    /// Withdraw the local node from the cluster view and release transports
    pub async fn shutdown(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let node = self.node();
        let removed = {
            let _guard = self.membership_lock.lock().await;
            self.node_groups.remove(&node).await
        };

        let transports: Vec<_> = self.transports.lock().await.drain().collect();
        for (channel, transport) in transports {
            if let Some(consumer) = transport.consumer {
                if let Err(e) = consumer.stop().await {
                    tracing::warn!("Failed to stop consumer on {}: {}", channel, e);
                }
            }
        }
        self.states.write().await.clear();

        *running = false;
        tracing::info!("Group manager on node {} shut down", node.id);
        removed.map(|_| ())
    }

    /// Whether [`GroupManager::init`] has completed and shutdown has not
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Push local configuration changes to the cluster.
    ///
    /// Returns the number of replicated entries written.
    pub async fn on_local_change(&self) -> Result<usize> {
        let updates = {
            let _guard = self.config_lock.lock().await;
            let properties = self.read_local(&self.settings.pid).await?;
            self.reconciler.push(&properties).await
        };
        merge_updates(self.group_config.as_ref(), self.cluster.as_ref(), updates).await
    }

    /// Merge one replicated entry into the local configuration.
    ///
    /// Returns whether the local configuration was changed and persisted.
    pub async fn on_replicated_change(&self, key: &str, value: Option<&serde_json::Value>) -> Result<bool> {
        let _guard = self.config_lock.lock().await;
        self.pull_entry(key, value).await
    }

    /// Pull every replicated entry into the local configuration
    pub async fn resync(&self) -> Result<bool> {
        let _guard = self.config_lock.lock().await;
        let mut properties = self.read_local(&self.settings.pid).await?;
        let mut changed_keys = Vec::new();

        for (key, value) in self.group_config.entries().await? {
            let outcome = self.reconciler.pull(&key, Some(&value), &mut properties).await;
            changed_keys.extend(outcome.changed_keys);
        }

        if changed_keys.is_empty() {
            return Ok(false);
        }

        tracing::debug!("Cluster group configuration differs, updating local configuration");
        self.local_config.write(&self.settings.pid, &properties).await?;
        self.reconciler
            .commit(&properties, &PullOutcome { changed_keys })
            .await;
        Ok(true)
    }

    /// Join `name`: activate its channel, record the membership in the
    /// cluster and locally, then run the synchronizers.
    ///
    /// Every step is idempotent; if a step fails the group stays
    /// [`GroupState::Joining`] and the call can be retried.
    pub async fn register_group(&self, name: &str) -> Result<Group> {
        validate_group_name(name)?;
        if !self.is_running().await {
            return Err(Error::ShuttingDown);
        }
        tracing::debug!("Registering group {}", name);
        self.set_state(name, GroupState::Joining).await;

        if let Err(e) = self.activate_transport(name).await {
            if e.is_degraded() {
                tracing::warn!("Group {} joined without messaging: {}", name, e);
            } else {
                tracing::error!("Group {} messaging failed: {}", name, e);
            }
        }

        let node = self.node();
        self.update_membership(|groups| groups.insert(name.to_string()))
            .await?;

        let groups_key = self.settings.groups_key.clone();
        self.update_local(&self.settings.pid, |props| add_group_name(props, &groups_key, name))
            .await?;
        self.update_local(&self.settings.node_pid, |props| add_group_name(props, &groups_key, name))
            .await?;

        let mut group = self
            .registry
            .find_group_by_name(name)
            .await?
            .unwrap_or_else(|| Group::new(name));
        group.members.insert(node);

        let failures = self.run_synchronizers(&group).await;
        if failures > 0 {
            tracing::warn!("{} synchronizer(s) failed for group {}", failures, name);
        }

        self.set_state(name, GroupState::Member).await;
        tracing::info!("Joined group {}", name);
        Ok(group)
    }

    /// Leave `name`: release its channel and withdraw this node's membership
    /// from the cluster and from the persisted memberships.
    ///
    /// The group itself stays known cluster-wide; use
    /// [`GroupManager::delete_group`] to remove it.
    pub async fn unregister_group(&self, name: &str) -> Result<Group> {
        validate_group_name(name)?;
        if !self.is_running().await {
            return Err(Error::ShuttingDown);
        }
        tracing::debug!("Unregistering group {}", name);
        self.set_state(name, GroupState::Leaving).await;

        let node = self.node();
        let mut group = self
            .registry
            .find_group_by_name(name)
            .await?
            .unwrap_or_else(|| Group::new(name));
        group.members.remove(&node);

        self.deactivate_transport(name).await;

        self.update_membership(|groups| groups.remove(name)).await?;

        let groups_key = self.settings.groups_key.clone();
        self.update_local(&self.settings.node_pid, |props| remove_group_name(props, &groups_key, name))
            .await?;

        self.states.write().await.remove(name);
        tracing::info!("Left group {}", name);
        Ok(group)
    }

    /// Declare a new group in the local configuration, seeding its
    /// properties from the default group.
    ///
    /// Returns the existing group if `name` is already known, `None` if it was
    /// created (it materializes once the configuration change is applied).
    pub async fn create_group(&self, name: &str) -> Result<Option<Group>> {
        validate_group_name(name)?;
        if let Some(group) = self.registry.find_group_by_name(name).await? {
            return Ok(Some(group));
        }

        let groups_key = self.settings.groups_key.clone();
        let source_prefix = format!("{}.", self.settings.default_group);
        self.update_local(&self.settings.pid, |props| {
            let copied: Vec<(String, String)> = props
                .iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&source_prefix)
                        .map(|rest| (format!("{}.{}", name, rest), value.clone()))
                })
                .collect();
            props.extend(copied);
            add_group_name(props, &groups_key, name);
            true
        })
        .await?;

        tracing::info!("Created group {}", name);
        Ok(None)
    }

    /// Remove a group from the local configuration. The default group cannot
    /// be deleted.
    pub async fn delete_group(&self, name: &str) -> Result<()> {
        if name == self.settings.default_group {
            tracing::warn!("Refusing to delete the {} group", name);
            return Ok(());
        }

        let groups_key = self.settings.groups_key.clone();
        if self
            .update_local(&self.settings.pid, |props| remove_group_name(props, &groups_key, name))
            .await?
        {
            tracing::info!("Deleted group {}", name);
        }
        Ok(())
    }

    /// Every known group with its members, keyed by name
    pub async fn list_groups(&self) -> Result<BTreeMap<String, Group>> {
        self.registry.list_groups().await
    }

    /// Known groups that `node` has joined
    pub async fn list_groups_for(&self, node: &Node) -> Result<Vec<Group>> {
        self.registry.list_groups_for(node).await
    }

    /// Every known group
    pub async fn list_all_groups(&self) -> Result<Vec<Group>> {
        self.registry.list_all_groups().await
    }

    /// Groups the local node has joined
    pub async fn list_local_groups(&self) -> Result<Vec<Group>> {
        self.registry.list_groups_for(&self.node()).await
    }

    /// Names of the groups the local node is a member of
    pub async fn list_group_names(&self) -> Result<BTreeSet<String>> {
        self.registry.list_group_names_for(&self.node()).await
    }

    /// Names of the groups `node` is a member of
    pub async fn list_group_names_for(&self, node: &Node) -> Result<BTreeSet<String>> {
        self.registry.list_group_names_for(node).await
    }

    pub async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        self.registry.find_group_by_name(name).await
    }

    /// Whether the local node has joined `name`
    pub async fn is_local_group(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_local_groups()
            .await?
            .iter()
            .any(|group| group.name == name))
    }

    /// Lifecycle state of `name` on this node
    pub async fn group_state(&self, name: &str) -> GroupState {
        self.states
            .read()
            .await
            .get(name)
            .copied()
            .unwrap_or(GroupState::NotMember)
    }

    /// Active producer for the channel of `name`
    pub async fn producer(&self, name: &str) -> Option<Arc<dyn EventProducer>> {
        self.transports
            .lock()
            .await
            .get(name)
            .and_then(|t| t.producer.clone())
    }

    /// Active consumer for the channel of `name`
    pub async fn consumer(&self, name: &str) -> Option<Arc<dyn EventConsumer>> {
        self.transports
            .lock()
            .await
            .get(name)
            .and_then(|t| t.consumer.clone())
    }

    /// Channels with both a producer and a consumer
    pub async fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .transports
            .lock()
            .await
            .iter()
            .filter(|(_, t)| t.producer.is_some() && t.consumer.is_some())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    async fn read_local(&self, pid: &str) -> Result<Properties> {
        Ok(self.local_config.read(pid).await?.unwrap_or_default())
    }

    /// Caller must hold `config_lock`
    async fn pull_entry(&self, key: &str, value: Option<&serde_json::Value>) -> Result<bool> {
        let mut properties = self.read_local(&self.settings.pid).await?;
        let outcome = self.reconciler.pull(key, value, &mut properties).await;
        if !outcome.changed() {
            return Ok(false);
        }

        tracing::debug!(
            "Cluster group configuration has been updated, updating local configuration: {}",
            key
        );
        self.local_config.write(&self.settings.pid, &properties).await?;
        self.reconciler.commit(&properties, &outcome).await;
        Ok(true)
    }

    /// Apply `f` to a local configuration and persist it if `f` reports a
    /// change. Nothing is written on failure.
    async fn update_local<F>(&self, pid: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Properties) -> bool,
    {
        let _guard = self.config_lock.lock().await;
        let mut properties = self.read_local(pid).await.map_err(|e| {
            tracing::error!("Failed to read local configuration {}: {}", pid, e);
            e
        })?;

        if !f(&mut properties) {
            return Ok(false);
        }

        self.local_config.write(pid, &properties).await.map_err(|e| {
            tracing::error!("Failed to store local configuration {}: {}", pid, e);
            e
        })?;
        Ok(true)
    }

    /// Read-modify-write of this node's entry in the node-to-groups map.
    /// Only this node writes its own entry, so a local lock is enough.
    async fn update_membership<F>(&self, f: F) -> Result<BTreeSet<String>>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _guard = self.membership_lock.lock().await;
        let node = self.node();
        let mut groups = self.node_groups.get(&node).await?.unwrap_or_default();
        if f(&mut groups) {
            self.node_groups.put(node, groups.clone()).await?;
        }
        Ok(groups)
    }

    /// Memberships persisted by previous joins. A node that never joined
    /// anything is recorded as a member of the default group.
    async fn persisted_memberships(&self) -> Result<BTreeSet<String>> {
        let groups_key = &self.settings.groups_key;
        let default_group = &self.settings.default_group;
        self.update_local(&self.settings.node_pid, |props| {
            if props.contains_key(groups_key) {
                return false;
            }
            props.insert(groups_key.clone(), default_group.clone());
            true
        })
        .await?;

        let properties = self.read_local(&self.settings.node_pid).await?;
        Ok(parse_group_names(properties.get(groups_key).map(String::as_str)))
    }

    async fn set_state(&self, name: &str, state: GroupState) {
        tracing::trace!("Group {} is now {}", name, state);
        self.states.write().await.insert(name.to_string(), state);
    }

    /// Ensure the channel of `name` has a producer and a running consumer
    async fn activate_transport(&self, name: &str) -> Result<()> {
        let exclusive = self.settings.exclusive_transport;
        let mut transports = self.transports.lock().await;
        let transport = transports.entry(name.to_string()).or_default();
        let mut failure = None;

        if transport.producer.is_none() {
            match self.transport_factory.producer(name, exclusive).await {
                Ok(producer) => transport.producer = Some(producer),
                Err(e) => failure = Some(e),
            }
        }

        match transport.consumer.clone() {
            None => match self.transport_factory.consumer(name, exclusive).await {
                Ok(consumer) => transport.consumer = Some(consumer),
                Err(e) => failure = failure.or(Some(e)),
            },
            Some(consumer) if !consumer.is_consuming() => {
                tracing::debug!("Restarting consumer for group {}", name);
                if let Err(e) = consumer.start().await {
                    failure = failure.or(Some(e));
                }
            }
            Some(_) => {}
        }

        match failure {
            None => Ok(()),
            Some(e @ Error::TransportRegistration { .. }) => Err(e),
            Some(e) => Err(Error::TransportRegistration {
                channel: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn deactivate_transport(&self, name: &str) {
        let transport = self.transports.lock().await.remove(name);
        if let Some(consumer) = transport.and_then(|t| t.consumer) {
            if let Err(e) = consumer.stop().await {
                tracing::warn!("Failed to stop consumer for group {}: {}", name, e);
            }
        }
    }

    /// Run every synchronizer for `group`; returns the number that failed
    async fn run_synchronizers(&self, group: &Group) -> usize {
        let synchronizers = self.synchronizers.read().await.clone();
        if synchronizers.is_empty() {
            return 0;
        }

        let results = join_all(synchronizers.iter().map(|synchronizer| async move {
            (synchronizer.name().to_string(), synchronizer.sync(group).await)
        }))
        .await;

        let mut failures = 0;
        for (name, result) in results {
            match result {
                Ok(()) => tracing::debug!("Synchronizer {} synced group {}", name, group.name),
                Err(e) => {
                    failures += 1;
                    tracing::error!("Synchronizer {} failed for group {}: {}", name, group.name, e);
                }
            }
        }
        failures
    }

    fn spawn_local_listener(self: &Arc<Self>, events: broadcast::Receiver<ConfigEvent>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = BroadcastStream::new(events);
            while let Some(event) = events.next().await {
                let relevant = match event {
                    Ok(event) => event.pid == manager.settings.pid && event.kind == ConfigEventKind::Updated,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!("Local configuration listener lagged by {} event(s)", skipped);
                        true
                    }
                };
                if !relevant {
                    continue;
                }
                match manager.on_local_change().await {
                    Err(e) if e.is_degraded() => {
                        tracing::debug!("Cluster group configuration update skipped: {}", e)
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Failed to update cluster group configuration: {}", e)
                    }
                    Err(e) => tracing::error!("Failed to update cluster group configuration: {}", e),
                    Ok(_) => {}
                }
            }
        })
    }

    fn spawn_replicated_listener(
        self: &Arc<Self>,
        events: broadcast::Receiver<EntryEvent<String, serde_json::Value>>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = BroadcastStream::new(events);
            while let Some(event) = events.next().await {
                let result = match event {
                    Ok(event) => {
                        tracing::trace!("Group configuration {} {}", event.key, event.kind);
                        manager
                            .on_replicated_change(&event.key, event.value.as_ref())
                            .await
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Group configuration listener lagged by {} event(s), resynchronizing",
                            skipped
                        );
                        manager.resync().await
                    }
                };
                match result {
                    Err(e) if e.is_degraded() => tracing::debug!("Local configuration update skipped: {}", e),
                    Err(e) if e.is_retryable() => tracing::warn!("Failed to update local configuration: {}", e),
                    Err(e) => tracing::error!("Failed to update local configuration: {}", e),
                    Ok(_) => {}
                }
            }
        })
    }
}

fn add_group_name(properties: &mut Properties, groups_key: &str, name: &str) -> bool {
    let mut names = parse_group_names(properties.get(groups_key).map(String::as_str));
    if !names.insert(name.to_string()) {
        return false;
    }
    properties.insert(groups_key.to_string(), format_group_names(&names));
    true
}

fn remove_group_name(properties: &mut Properties, groups_key: &str, name: &str) -> bool {
    let mut names = parse_group_names(properties.get(groups_key).map(String::as_str));
    if !names.remove(name) {
        return false;
    }
    properties.insert(groups_key.to_string(), format_group_names(&names));
    true
}
