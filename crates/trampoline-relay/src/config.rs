//! Configuration: the node fee policy and the handful of other configuration keys the relay
//! consumes, held behind `Arc<RwLock<_>>` and updatable at runtime, mirroring the rest of the
//! node's runtime-updatable settings.

use crate::model::NodeFeePolicy;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Runtime-updatable relay configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub fee_policy: NodeFeePolicy,
    /// Handed to the outgoing payment engine as its retry budget for this relay.
    pub max_payment_attempts: u32,
}

impl Default for RelaySettings {
    /// Default fee policy: fee_base = 1000 msat, prop = 100 ppm, expiry_delta = 40.
    fn default() -> Self {
        Self {
            fee_policy: NodeFeePolicy {
                fee_base_msat: 1000,
                fee_proportional_millionth: 100,
                expiry_delta: 40,
            },
            max_payment_attempts: 10,
        }
    }
}

/// Shared, runtime-updatable settings handle, the same `Arc<RwLock<_>>` shape the node's other
/// settings fields use.
#[derive(Debug, Clone)]
pub struct SharedRelaySettings(Arc<RwLock<RelaySettings>>);

impl SharedRelaySettings {
    pub fn new(settings: RelaySettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub async fn current(&self) -> RelaySettings {
        *self.0.read().await
    }

    pub async fn update(&self, new_settings: RelaySettings) {
        tracing::info!(?new_settings, "Updating trampoline relay settings");
        *self.0.write().await = new_settings;
    }
}

impl Default for SharedRelaySettings {
    fn default() -> Self {
        Self::new(RelaySettings::default())
    }
}

/// The one dynamically-read configuration value the relay needs that isn't part of
/// `RelaySettings`: `current_block_height`. Modelled as its own trait because, unlike the rest of
/// `RelaySettings`, it changes on every block and is naturally owned by the on-chain
/// wallet/chain-sync subsystem rather than threaded through static settings.
#[async_trait]
pub trait BlockHeightSource: Send + Sync {
    async fn current_block_height(&self) -> u32;
}
