//! Cross-instance group fan-out.
//!
//! When several server processes host connections for the same group,
//! each registry republishes its group broadcasts through a
//! [`GroupBridge`] and applies what the other instances publish. The
//! bridge transport is pluggable; the registry logic is identical
//! whether the fleet is one process or many. [`InProcessBus`] is the
//! single-process implementation, also used to pair registries in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use parley_core::envelope::Envelope;
use parley_core::ids::GroupId;

/// Capacity of the in-process bus channel.
const BUS_CAPACITY: usize = 256;

/// A broadcast republished across server instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    /// Instance that originated the broadcast (echo filter key).
    pub origin_instance: String,
    /// Target group.
    pub group: GroupId,
    /// The broadcast envelope.
    pub envelope: Envelope,
}

/// Bridge publish failure.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The underlying channel rejected the message.
    #[error("bridge channel unavailable")]
    ChannelClosed,
}

/// Pluggable cross-process publish/subscribe channel.
#[async_trait]
pub trait GroupBridge: Send + Sync {
    /// This instance's identifier, used to filter out its own messages.
    fn instance_id(&self) -> &str;

    /// Republish a locally originated group broadcast.
    async fn publish(&self, message: BridgeMessage) -> Result<(), BridgeError>;

    /// Subscribe to broadcasts from every instance on the channel.
    fn subscribe(&self) -> broadcast::Receiver<BridgeMessage>;
}

/// Shared in-process channel connecting bridge endpoints.
#[derive(Clone)]
pub struct InProcessBus {
    tx: broadcast::Sender<BridgeMessage>,
}

impl InProcessBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Create an endpoint for one registry instance.
    #[must_use]
    pub fn endpoint(&self, instance_id: impl Into<String>) -> InProcessBridge {
        InProcessBridge {
            instance_id: instance_id.into(),
            tx: self.tx.clone(),
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance's endpoint on an [`InProcessBus`].
pub struct InProcessBridge {
    instance_id: String,
    tx: broadcast::Sender<BridgeMessage>,
}

#[async_trait]
impl GroupBridge for InProcessBridge {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        // send only fails when there are no subscribers, which is not an
        // error for a fleet of one.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeMessage> {
        self.tx.subscribe()
    }
}
