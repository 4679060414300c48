//! In-process transport over tokio broadcast channels

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::{Event, EventConsumer, EventHandler, EventProducer, EventTransportFactory};
use crate::error::{Error, Result};

/// Transport factory whose channels live inside the current process
pub struct LocalTransportFactory {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    handler: Option<Arc<dyn EventHandler>>,
    rejected: Mutex<HashSet<String>>,
}

impl LocalTransportFactory {
    /// Create a factory buffering `capacity` events per channel
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
            handler: None,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Deliver consumed events to `handler`
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Refuse to create endpoints for `channel`
    pub async fn reject(&self, channel: &str) {
        self.rejected.lock().await.insert(channel.to_string());
    }

    /// Accept endpoint creation for `channel` again
    pub async fn accept(&self, channel: &str) {
        self.rejected.lock().await.remove(channel);
    }

    async fn sender(&self, channel: &str) -> Result<broadcast::Sender<Event>> {
        if self.rejected.lock().await.contains(channel) {
            return Err(Error::TransportRegistration {
                channel: channel.to_string(),
                reason: "channel rejected by transport".into(),
            });
        }
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }
}

#[async_trait]
impl EventTransportFactory for LocalTransportFactory {
    async fn producer(&self, channel: &str, exclusive: bool) -> Result<Arc<dyn EventProducer>> {
        let sender = self.sender(channel).await?;
        tracing::debug!("Created producer for channel {} (exclusive: {})", channel, exclusive);
        Ok(Arc::new(LocalProducer {
            channel: channel.to_string(),
            sender,
        }))
    }

    async fn consumer(&self, channel: &str, exclusive: bool) -> Result<Arc<dyn EventConsumer>> {
        let sender = self.sender(channel).await?;
        let consumer = LocalConsumer {
            channel: channel.to_string(),
            sender,
            handler: self.handler.clone(),
            task: std::sync::Mutex::new(None),
        };
        consumer.start().await?;
        tracing::debug!("Created consumer for channel {} (exclusive: {})", channel, exclusive);
        Ok(Arc::new(consumer))
    }
}

struct LocalProducer {
    channel: String,
    sender: broadcast::Sender<Event>,
}

#[async_trait]
impl EventProducer for LocalProducer {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn produce(&self, event: Event) -> Result<()> {
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!("Produced event on {} to {} consumer(s)", self.channel, receivers);
                Ok(())
            }
            Err(_) => {
                // Nobody is consuming; the event is dropped like on an idle topic
                tracing::trace!("No active consumer on channel {}", self.channel);
                Ok(())
            }
        }
    }
}

struct LocalConsumer {
    channel: String,
    sender: broadcast::Sender<Event>,
    handler: Option<Arc<dyn EventHandler>>,
    /// Receive loop; consuming while it has not finished
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl EventConsumer for LocalConsumer {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut receiver = self.sender.subscribe();
        let handler = self.handler.clone();
        let channel = self.channel.clone();

        *task = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => match &handler {
                        Some(handler) => handler.handle(event).await,
                        None => tracing::trace!("Consumed event {} on {}", event.id, channel),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Consumer on {} lagged, skipped {} event(s)", channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Consumer loop on {} exited", channel);
        }));

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!("Stopped consumer on channel {}", self.channel);
        }
        Ok(())
    }

    fn is_consuming(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ForwardHandler(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for ForwardHandler {
        async fn handle(&self, event: Event) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_produce_consume() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = LocalTransportFactory::new(16).with_handler(Arc::new(ForwardHandler(tx)));

        let consumer = factory.consumer("ops", true).await.unwrap();
        assert!(consumer.is_consuming());
        let producer = factory.producer("ops", true).await.unwrap();

        let event = Event::new("ops", "node-1", serde_json::json!({"cmd": "ping"}));
        producer.produce(event.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = LocalTransportFactory::new(16).with_handler(Arc::new(ForwardHandler(tx)));
        let consumer = factory.consumer("ops", true).await.unwrap();
        let producer = factory.producer("ops", true).await.unwrap();

        consumer.stop().await.unwrap();
        assert!(!consumer.is_consuming());
        producer
            .produce(Event::new("ops", "node-1", serde_json::Value::Null))
            .await
            .unwrap();

        consumer.start().await.unwrap();
        assert!(consumer.is_consuming());
        producer
            .produce(Event::new("ops", "node-1", serde_json::json!(2)))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, serde_json::json!(2));
    }

    struct FragileHandler(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for FragileHandler {
        async fn handle(&self, event: Event) {
            if event.payload == serde_json::json!("crash") {
                panic!("handler crashed");
            }
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_restart_after_loop_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = LocalTransportFactory::new(16).with_handler(Arc::new(FragileHandler(tx)));
        let consumer = factory.consumer("ops", true).await.unwrap();
        let producer = factory.producer("ops", true).await.unwrap();

        producer
            .produce(Event::new("ops", "node-1", serde_json::json!("crash")))
            .await
            .unwrap();
        for _ in 0..100 {
            if !consumer.is_consuming() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!consumer.is_consuming());

        consumer.start().await.unwrap();
        assert!(consumer.is_consuming());
        producer
            .produce(Event::new("ops", "node-1", serde_json::json!(3)))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_rejected_channel() {
        let factory = LocalTransportFactory::new(16);
        factory.reject("ops").await;

        let err = factory.producer("ops", true).await.err().unwrap();
        assert!(matches!(err, Error::TransportRegistration { .. }));
        assert!(factory.consumer("other", true).await.is_ok());

        factory.accept("ops").await;
        assert!(factory.producer("ops", true).await.is_ok());
    }
}
