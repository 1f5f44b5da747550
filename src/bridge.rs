//! Per-instance delivery loops bridging output queues to subscribers.
//!
//! Subscription membership is keyed by instance id, room style: the first
//! subscriber for an id starts that id's delivery loop, later subscribers
//! join the existing broadcast, and the loop exits once the last
//! subscriber leaves. Cancellation is cooperative: the loop checks the
//! room at the top of each poll cycle, so worst-case shutdown latency is
//! one poll interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::history::HistorySink;
use crate::instances::{CompleteReply, InstanceManager};

/// Broadcast payload for one complete reply from one instance.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyEvent {
    pub instance_id: String,
    pub content: String,
    pub raw_content: String,
    pub timestamp: String,
    pub is_markdown: bool,
}

impl ReplyEvent {
    fn from_reply(instance_id: &str, reply: CompleteReply) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            content: reply.content,
            raw_content: reply.raw_content,
            timestamp: reply.timestamp,
            is_markdown: true,
        }
    }
}

struct Room {
    subscribers: usize,
    sender: broadcast::Sender<ReplyEvent>,
    /// Identifies which spawned loop owns this room. A room recreated
    /// after its last unsubscribe gets a fresh epoch, so a not-yet-exited
    /// old loop can never drain alongside the new one.
    epoch: u64,
}

#[derive(Clone)]
pub struct SubscriptionBridge {
    manager: Arc<InstanceManager>,
    history: Arc<dyn HistorySink>,
    rooms: Arc<DashMap<String, Room>>,
    next_epoch: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl SubscriptionBridge {
    pub fn new(
        manager: Arc<InstanceManager>,
        history: Arc<dyn HistorySink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            history,
            rooms: Arc::new(DashMap::new()),
            next_epoch: Arc::new(AtomicU64::new(0)),
            poll_interval,
        }
    }

    /// Join the room for `instance_id`. The first subscriber starts the
    /// delivery loop; everyone else taps into the same broadcast.
    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<ReplyEvent> {
        let mut spawn_epoch = None;
        let receiver = {
            let mut room = self
                .rooms
                .entry(instance_id.to_string())
                .or_insert_with(|| {
                    let (sender, _) = broadcast::channel(256);
                    Room {
                        subscribers: 0,
                        sender,
                        epoch: 0, // assigned below, as for any empty room
                    }
                });
            if room.subscribers == 0 {
                // Also covers a room caught between its last unsubscribe
                // and removal: a fresh epoch retires the old loop.
                room.epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                spawn_epoch = Some(room.epoch);
            }
            room.subscribers += 1;
            room.sender.subscribe()
        };

        if let Some(epoch) = spawn_epoch {
            info!(instance = %instance_id, "starting delivery loop");
            tokio::spawn(self.clone().deliver(instance_id.to_string(), epoch));
        }
        receiver
    }

    /// Leave the room. When the last subscriber leaves, the room is
    /// removed and the delivery loop exits at its next poll.
    pub fn unsubscribe(&self, instance_id: &str) {
        let emptied = match self.rooms.get_mut(instance_id) {
            Some(mut room) => {
                room.subscribers = room.subscribers.saturating_sub(1);
                room.subscribers == 0
            }
            None => false,
        };
        if emptied {
            self.rooms
                .remove_if(instance_id, |_, room| room.subscribers == 0);
            debug!(instance = %instance_id, "last subscriber left");
        }
    }

    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.rooms
            .get(instance_id)
            .map(|room| room.subscribers)
            .unwrap_or(0)
    }

    /// Whether a delivery loop currently owns `instance_id`.
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.rooms.contains_key(instance_id)
    }

    async fn deliver(self, instance_id: String, epoch: u64) {
        loop {
            let owned = match self.rooms.get(&instance_id) {
                Some(room) => room.epoch == epoch && room.subscribers > 0,
                None => false,
            };
            if !owned {
                break;
            }

            let instance = match self.manager.get(&instance_id).await {
                Some(instance) => instance,
                None => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };
            if !instance.is_running().await {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            for reply in instance.output().drain().await {
                self.history.record_message(
                    &format!("instance {instance_id}"),
                    &reply.raw_content,
                    &instance_id,
                );

                let event = ReplyEvent::from_reply(&instance_id, reply);
                // Operator-facing echo of the framed reply.
                println!("{}", event.content);

                if let Some(room) = self.rooms.get(&instance_id) {
                    if room.sender.send(event).is_err() {
                        debug!(instance = %instance_id, "reply broadcast had no receivers");
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!(instance = %instance_id, "delivery loop stopped");
    }
}
