use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use orchestrate_common::bus::{OperationEvent, CHANNEL_ORCHESTRATE_EVENTS};

/// Side channel for Operation transitions. Delivery is best effort.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, evt: &OperationEvent) -> anyhow::Result<()>;
}

pub struct RedisPublisher {
    client: redis::Client,
}

impl RedisPublisher {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, evt: &OperationEvent) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis (publisher)")?;
        let payload = serde_json::to_string(evt)?;
        let _: () = conn.publish(CHANNEL_ORCHESTRATE_EVENTS, payload).await?;
        Ok(())
    }
}

/// Used when REDIS_URL is not configured.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _evt: &OperationEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<OperationEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, evt: &OperationEvent) -> anyhow::Result<()> {
        self.events.lock().push(evt.clone());
        Ok(())
    }
}
