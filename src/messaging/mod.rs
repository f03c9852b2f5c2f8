//! # Messaging Collaborator
//!
//! Distribution of executed activities to the other nodes. Activities whose
//! serialized form exceeds the configured threshold travel as a
//! [`Message::BigActivity`] reference and the receiver loads the body from
//! the data provider.

pub mod in_process;

pub use in_process::{InProcessMessageBus, InProcessMessageProvider};

use crate::activities::SecurityActivity;
use crate::data::SecurityDataProvider;
use crate::error::SecurityResult;
use crate::model::ActivityId;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum Message {
    Activity(SecurityActivity),
    BigActivity { id: ActivityId },
}

/// A message with the node it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub message: Message,
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Identity of this node on the channel
    fn node_id(&self) -> &str;

    async fn send(&self, message: Message) -> SecurityResult<()>;

    /// Inbound stream of this node. Handed out once.
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Envelope>>;

    fn is_me(&self, sender: &str) -> bool {
        sender == self.node_id()
    }
}

/// Messaging for a single node: nothing is sent, nothing arrives
#[derive(Debug, Clone)]
pub struct NullMessageProvider {
    node_id: String,
}

impl NullMessageProvider {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl Default for NullMessageProvider {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

#[async_trait]
impl MessageProvider for NullMessageProvider {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, _message: Message) -> SecurityResult<()> {
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        None
    }
}

/// The message that carries `activity`, by value or by reference
pub fn outgoing_message(activity: &SecurityActivity, threshold_bytes: usize) -> SecurityResult<Message> {
    let size = serde_json::to_vec(activity)?.len();
    if size > threshold_bytes {
        debug!(
            "Activity {} is {} bytes, sending it by reference",
            activity.id, size
        );
        return Ok(Message::BigActivity { id: activity.id });
    }
    Ok(Message::Activity(activity.clone()))
}

/// The activity a message carries, loading big ones from the store.
/// `None` when a referenced activity is not in the store.
pub async fn resolve_message(
    message: Message,
    data: &dyn SecurityDataProvider,
) -> SecurityResult<Option<SecurityActivity>> {
    match message {
        Message::Activity(activity) => Ok(Some(activity)),
        Message::BigActivity { id } => data.load_activity(id).await,
    }
}
