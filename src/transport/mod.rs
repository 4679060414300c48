//! Transport Module
//!
//! Group-scoped messaging endpoints. Every group owns one channel named
//! after the group; joining a group activates a producer and a consumer
//! on that channel.

mod local;

pub use local::LocalTransportFactory;

use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Event carried on a group channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: uuid::Uuid,
    /// Group channel the event was produced on
    pub channel: String,
    /// Identifier of the producing node
    pub source: String,
    /// Opaque payload
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event with a fresh identifier
    pub fn new(channel: impl Into<String>, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            channel: channel.into(),
            source: source.into(),
            payload,
        }
    }
}

/// Sends events to a group channel
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Channel this producer writes to
    fn channel(&self) -> &str;

    /// Send an event to every consumer of the channel
    async fn produce(&self, event: Event) -> Result<()>;
}

/// Receives events from a group channel
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Channel this consumer reads from
    fn channel(&self) -> &str;

    /// Start (or restart) consuming
    async fn start(&self) -> Result<()>;

    /// Stop consuming
    async fn stop(&self) -> Result<()>;

    /// Whether the consumer is currently consuming
    fn is_consuming(&self) -> bool;
}

/// Handles events delivered to a consumer
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Creates producers and consumers for group channels
#[async_trait]
pub trait EventTransportFactory: Send + Sync {
    /// Create a producer for `channel`
    async fn producer(&self, channel: &str, exclusive: bool) -> Result<Arc<dyn EventProducer>>;

    /// Create a consumer for `channel`; it is returned already consuming
    async fn consumer(&self, channel: &str, exclusive: bool) -> Result<Arc<dyn EventConsumer>>;
}
