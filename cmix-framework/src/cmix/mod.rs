//! The seam between the client core and the mix network transport.
//!
//! The core never talks to gateways or nodes itself: it hands an assembler closure to a
//! [CmixClient] which invokes it once a round has been chosen, and registers
//! [MessageProcessor]s that receive cells addressed to a tracked identity and service.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    cell::{CellParts, MixCell, Service},
    id::{EphemeralId, ReceptionId, RoundId},
};

mod loopback;

pub use loopback::{LoopbackClient, LoopbackConfig, LoopbackNetwork};

/// Error produced by a message assembler, boxed so that callers may smuggle their own error
/// type through the transport and downcast it afterwards
pub type AssemblyError = Box<dyn std::error::Error + Send + Sync>;

/// Builds the cell to send once the network has selected the round it will travel in
pub type Assembler = Box<dyn FnOnce(RoundId) -> Result<CellParts, AssemblyError> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum CmixError {
    #[error("Network is not healthy")]
    NotHealthy,
    #[error("Cell contents are {len} bytes, network requires exactly {expected}")]
    ContentsSize { len: usize, expected: usize },
    #[error("Failed to assemble message: {0}")]
    Assembly(AssemblyError),
    #[error("No round could be found to send in after {0} tries")]
    NoRound(u32),
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-send parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CmixParams {
    /// Tag attached to log output for this send
    pub debug_tag: String,
    /// Maximum time to wait for a round to be selected and the message to be sent
    pub timeout: Duration,
    /// Number of rounds to attempt before giving up
    pub round_tries: u32,
}

impl Default for CmixParams {
    fn default() -> Self {
        Self {
            debug_tag: "External".to_owned(),
            timeout: Duration::from_secs(30),
            round_tries: 10,
        }
    }
}

impl CmixParams {
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            debug_tag: tag.into(),
            ..Default::default()
        }
    }
}

/// Round metadata reported with every received cell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundInfo {
    pub id: RoundId,
    pub timestamp: DateTime<Utc>,
}

/// Reception metadata reported with every received cell
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceptionInfo {
    /// Identity the cell was addressed to
    pub recipient: ReceptionId,
    pub ephemeral_id: EphemeralId,
    /// Tag of the service the cell was delivered through
    pub service_tag: String,
}

/// Outcome of a successful send
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentRound {
    pub round: RoundId,
    pub ephemeral_id: EphemeralId,
}

/// Receives cells that arrive for a registered identity and service
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, cell: MixCell, reception: ReceptionInfo, round: RoundInfo);
}

/// Abstract access to the mix network
#[async_trait]
pub trait CmixClient: Send + Sync {
    /// Number of contents bytes in every cell sent over this network
    fn max_message_length(&self) -> usize;

    /// Whether the network is currently usable for sending
    fn is_healthy(&self) -> bool;

    /// Select a round, invoke `assembler` with its ID, and send the produced cell to `recipient`
    async fn send_with_assembler(
        &self,
        recipient: ReceptionId,
        assembler: Assembler,
        params: &CmixParams,
    ) -> Result<SentRound, CmixError>;

    /// Route cells received for `client_id` carrying `service`'s tag to `processor`
    fn add_service(
        &self,
        client_id: ReceptionId,
        service: Service,
        processor: Arc<dyn MessageProcessor>,
    );

    /// Remove every service registered for `client_id`
    fn delete_client_service(&self, client_id: &ReceptionId);

    /// Start tracking an identity so that messages sent to it are picked up. `valid_until` of
    /// `None` tracks it indefinitely
    fn add_identity(&self, id: ReceptionId, valid_until: Option<DateTime<Utc>>, persistent: bool);

    fn remove_identity(&self, id: &ReceptionId);
}
