//! Redis-backed directory for multi-instance deployments
//!
//! Records live as JSON strings under a prefixed key per device, and
//! change events fan out over a pub/sub channel. A background listener
//! republishes incoming events onto a local broadcast channel, so
//! `watch()` looks the same for every backend.

use std::time::Duration;

use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cira_proto::DeviceId;

use crate::{DirectoryError, OwnershipDirectory, OwnershipEvent, OwnershipRecord, EVENT_BUFFER};

const DEFAULT_KEY_PREFIX: &str = "cira:owner:";
const DEFAULT_EVENTS_CHANNEL: &str = "cira:ownership:events";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct RedisDirectory {
    conn: ::redis::aio::ConnectionManager,
    key_prefix: String,
    events_channel: String,
    events: broadcast::Sender<OwnershipEvent>,
    listener: JoinHandle<()>,
}

impl RedisDirectory {
    /// Connect with the default key prefix and events channel.
    pub async fn connect(url: &str) -> Result<Self, DirectoryError> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX, DEFAULT_EVENTS_CHANNEL).await
    }

    /// Connect with an explicit key prefix and events channel, so several
    /// independent broker fleets can share one Redis.
    pub async fn connect_with_prefix(
        url: &str,
        key_prefix: &str,
        events_channel: &str,
    ) -> Result<Self, DirectoryError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let listener = tokio::spawn(Self::run_listener(
            client,
            events_channel.to_string(),
            events.clone(),
        ));

        debug!(events_channel, "Connected to Redis directory");
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            events_channel: events_channel.to_string(),
            events,
            listener,
        })
    }

    fn record_key(&self, device_id: DeviceId) -> String {
        format!("{}{}", self.key_prefix, device_id)
    }

    async fn run_listener(
        client: ::redis::Client,
        channel: String,
        events: broadcast::Sender<OwnershipEvent>,
    ) {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(e) = pubsub.subscribe(&channel).await {
                        warn!("Directory event subscription failed: {}", e);
                    } else {
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!("Unreadable directory event payload: {}", e);
                                    continue;
                                }
                            };
                            match serde_json::from_str::<OwnershipEvent>(&payload) {
                                Ok(event) => {
                                    let _ = events.send(event);
                                }
                                Err(e) => warn!("Ignoring malformed directory event: {}", e),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Directory event connection failed: {}", e);
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn publish_event(&self, event: &OwnershipEvent) -> Result<(), DirectoryError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(&self.events_channel, payload).await?;
        Ok(())
    }
}

impl Drop for RedisDirectory {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl OwnershipDirectory for RedisDirectory {
    async fn publish(
        &self,
        device_id: DeviceId,
        record: OwnershipRecord,
    ) -> Result<(), DirectoryError> {
        let key = self.record_key(device_id);
        let mut conn = self.conn.clone();

        let existing: Option<String> = conn.get(&key).await?;
        let same_owner = existing
            .as_deref()
            .and_then(|raw| serde_json::from_str::<OwnershipRecord>(raw).ok())
            .map(|current| current.instance_id == record.instance_id)
            .unwrap_or(false);

        let _: () = conn.set(&key, serde_json::to_string(&record)?).await?;
        if !same_owner {
            self.publish_event(&OwnershipEvent::Published { device_id, record })
                .await?;
        }
        Ok(())
    }

    async fn retract(&self, device_id: DeviceId) -> Result<(), DirectoryError> {
        let key = self.record_key(device_id);
        let mut conn = self.conn.clone();

        let removed: i64 = conn.del(&key).await?;
        if removed > 0 {
            self.publish_event(&OwnershipEvent::Retracted { device_id })
                .await?;
        }
        Ok(())
    }

    async fn get(&self, device_id: DeviceId) -> Result<Option<OwnershipRecord>, DirectoryError> {
        let key = self.record_key(device_id);
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw
            .as_deref()
            .map(serde_json::from_str::<OwnershipRecord>)
            .transpose()?)
    }

    async fn watch(&self) -> Result<broadcast::Receiver<OwnershipEvent>, DirectoryError> {
        Ok(self.events.subscribe())
    }
}
