//! In-process message bus connecting several nodes of one process.
//!
//! Every published envelope is delivered to every connected node, the
//! sender included; receivers drop their own messages with `is_me`.

use super::{Envelope, Message, MessageProvider};
use crate::error::{SecurityError, SecurityResult};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Subscriber registry shared by the connected nodes
#[derive(Default)]
pub struct InProcessMessageBus {
    subscribers: tokio::sync::Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl InProcessMessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its provider
    pub async fn connect(self: &Arc<Self>, node_id: impl Into<String>) -> InProcessMessageProvider {
        let node_id = node_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .insert(node_id.clone(), sender);
        debug!("Node {} connected to the in-process bus", node_id);
        InProcessMessageProvider {
            node_id,
            bus: Arc::clone(self),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Deliver to every connected node. Returns the number of deliveries.
    pub async fn publish(&self, envelope: Envelope) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut closed = Vec::new();
        let mut delivered = 0;
        for (node_id, sender) in subscribers.iter() {
            if sender.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(node_id.clone());
            }
        }
        for node_id in closed {
            warn!("⚠️ Dropping disconnected node {} from the bus", node_id);
            subscribers.remove(&node_id);
        }
        delivered
    }

    pub async fn node_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

pub struct InProcessMessageProvider {
    node_id: String,
    bus: Arc<InProcessMessageBus>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

#[async_trait]
impl MessageProvider for InProcessMessageProvider {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, message: Message) -> SecurityResult<()> {
        let envelope = Envelope {
            sender: self.node_id.clone(),
            message,
        };
        if self.bus.publish(envelope).await == 0 {
            return Err(SecurityError::Messaging(format!(
                "no node is listening for messages from {}",
                self.node_id
            )));
        }
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.receiver.lock().ok().and_then(|mut slot| slot.take())
    }
}
