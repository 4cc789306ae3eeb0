//! An in-process stand-in for the mix network: every cell sent by any client of a
//! [LoopbackNetwork] is delivered to all clients that track the recipient identity and have a
//! service registered under the cell's tag

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{
    Assembler, CmixClient, CmixError, CmixParams, MessageProcessor, ReceptionInfo, RoundInfo,
    SentRound,
};
use crate::model::{
    cell::{contents_len, Service, DEFAULT_CELL_SIZE},
    crypto::sha256,
    id::{EphemeralId, ReceptionId, RoundId},
};

/// Configuration options for an in-process network
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Total size of every cell, including fingerprint and MAC
    pub cell_size: usize,
    /// Time between a send completing and the cell reaching processors
    pub delivery_delay: Duration,
    /// Time taken by every round a send is attempted in
    pub round_period: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            delivery_delay: Duration::ZERO,
            round_period: Duration::ZERO,
        }
    }
}

/// Key of a registration: the client that made it and the identity it is registered under
type ClientKey = (usize, ReceptionId);

#[derive(Clone)]
struct Registration {
    service: Service,
    processor: Arc<dyn MessageProcessor>,
}

/// Shared state of the in-process network. Create clients with [LoopbackNetwork::client]
pub struct LoopbackNetwork {
    cfg: LoopbackConfig,
    healthy: AtomicBool,
    /// Last round ID handed out
    round: AtomicU64,
    /// Number of upcoming rounds that fail
    failing_rounds: AtomicU32,
    next_client: AtomicUsize,
    identities: DashMap<ClientKey, Option<DateTime<Utc>>>,
    services: DashMap<ClientKey, Vec<Registration>>,
}

/// A single participant of a [LoopbackNetwork]
#[derive(Clone)]
pub struct LoopbackClient {
    id: usize,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackNetwork {
    /// Create a new healthy network
    pub fn new(cfg: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            healthy: AtomicBool::new(true),
            round: AtomicU64::new(0),
            failing_rounds: AtomicU32::new(0),
            next_client: AtomicUsize::new(0),
            identities: DashMap::new(),
            services: DashMap::new(),
        })
    }

    /// Create a new participant with no tracked identities
    pub fn client(self: &Arc<Self>) -> LoopbackClient {
        LoopbackClient {
            id: self.next_client.fetch_add(1, Ordering::SeqCst),
            network: self.clone(),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the next `count` rounds selected by any client fail, so that sends retry in a later
    /// round
    pub fn fail_rounds(&self, count: u32) {
        self.failing_rounds.store(count, Ordering::SeqCst);
    }

    /// Hand out the next round ID and whether that round fails
    fn next_round(&self) -> (RoundId, bool) {
        let round = RoundId(self.round.fetch_add(1, Ordering::SeqCst) + 1);
        let failed = self
            .failing_rounds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        (round, failed)
    }

    #[inline]
    pub const fn config(&self) -> &LoopbackConfig {
        &self.cfg
    }

    fn tracks(&self, key: &ClientKey) -> bool {
        self.identities
            .get(key)
            .map(|until| (*until).map_or(true, |t| t > Utc::now()))
            .unwrap_or(false)
    }

    /// Collect every processor that should receive a cell sent to `recipient` under `tag`
    fn receivers(&self, recipient: &ReceptionId, tag: &str) -> Vec<Arc<dyn MessageProcessor>> {
        self.services
            .iter()
            .filter(|entry| entry.key().1 == *recipient && self.tracks(entry.key()))
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|reg| reg.service.tag == tag)
                    .map(|reg| reg.processor.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Ephemeral IDs rotate per round on the real network, here they are a hash of both
fn ephemeral_id(recipient: &ReceptionId, round: RoundId) -> EphemeralId {
    let digest = sha256(&[recipient.as_bytes(), &round.0.to_le_bytes()]);
    let mut eph = [0u8; 8];
    eph.copy_from_slice(&digest[..8]);
    EphemeralId(i64::from_le_bytes(eph))
}

impl LoopbackClient {
    /// Try up to `round_tries` rounds, returning the first that does not fail
    async fn select_round(&self, params: &CmixParams) -> Result<RoundId, CmixError> {
        let period = self.network.cfg.round_period;
        for attempt in 1..=params.round_tries {
            if !period.is_zero() {
                tokio::time::sleep(period).await;
            }

            let (round, failed) = self.network.next_round();
            if !failed {
                return Ok(round);
            }
            log::debug!(
                "[{}] {} failed, attempt {} of {}",
                params.debug_tag,
                round,
                attempt,
                params.round_tries
            );
        }

        Err(CmixError::NoRound(params.round_tries))
    }
}

#[async_trait]
impl CmixClient for LoopbackClient {
    fn max_message_length(&self) -> usize {
        contents_len(self.network.cfg.cell_size)
    }

    fn is_healthy(&self) -> bool {
        self.network.healthy.load(Ordering::SeqCst)
    }

    async fn send_with_assembler(
        &self,
        recipient: ReceptionId,
        assembler: Assembler,
        params: &CmixParams,
    ) -> Result<SentRound, CmixError> {
        if !self.is_healthy() {
            return Err(CmixError::NotHealthy);
        }

        let round = tokio::time::timeout(params.timeout, self.select_round(params))
            .await
            .map_err(|_| CmixError::Timeout(params.timeout))??;
        let parts = assembler(round).map_err(CmixError::Assembly)?;

        let expected = self.max_message_length();
        if parts.contents.len() != expected {
            return Err(CmixError::ContentsSize {
                len: parts.contents.len(),
                expected,
            });
        }

        let (cell, service) = parts.into_cell();
        let ephemeral_id = ephemeral_id(&recipient, round);
        let info = RoundInfo {
            id: round,
            timestamp: Utc::now(),
        };

        let receivers = self.network.receivers(&recipient, &service.tag);
        log::trace!(
            "[{}] {} to {} via {} reaches {} processors",
            params.debug_tag,
            round,
            recipient.short(),
            service.tag,
            receivers.len()
        );

        let delay = self.network.cfg.delivery_delay;
        for processor in receivers {
            let cell = cell.clone();
            let reception = ReceptionInfo {
                recipient,
                ephemeral_id,
                service_tag: service.tag.clone(),
            };

            tokio::task::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                processor.process(cell, reception, info).await;
            });
        }

        Ok(SentRound {
            round,
            ephemeral_id,
        })
    }

    fn add_service(
        &self,
        client_id: ReceptionId,
        service: Service,
        processor: Arc<dyn MessageProcessor>,
    ) {
        log::debug!(
            "Client {} registered service {} for {}",
            self.id,
            service.tag,
            client_id.short()
        );

        self.network
            .services
            .entry((self.id, client_id))
            .or_default()
            .push(Registration { service, processor });
    }

    fn delete_client_service(&self, client_id: &ReceptionId) {
        self.network.services.remove(&(self.id, *client_id));
    }

    fn add_identity(&self, id: ReceptionId, valid_until: Option<DateTime<Utc>>, persistent: bool) {
        log::debug!(
            "Client {} tracking identity {} (persistent: {})",
            self.id,
            id.short(),
            persistent
        );
        self.network.identities.insert((self.id, id), valid_until);
    }

    fn remove_identity(&self, id: &ReceptionId) {
        self.network.identities.remove(&(self.id, *id));
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cmix::AssemblyError;
    use crate::model::cell::{CellParts, Fingerprint, Mac, MixCell};

    struct Forward(mpsc::UnboundedSender<(MixCell, ReceptionInfo)>);

    #[async_trait]
    impl MessageProcessor for Forward {
        async fn process(&self, cell: MixCell, reception: ReceptionInfo, _: RoundInfo) {
            let _ = self.0.send((cell, reception));
        }
    }

    fn assembler(len: usize, tag: &'static str) -> Assembler {
        Box::new(move |_: RoundId| -> Result<CellParts, AssemblyError> {
            Ok(CellParts {
                key_fp: Fingerprint([1u8; 25]),
                mac: Mac([2u8; 32]),
                contents: vec![3u8; len],
                service: Service::new(vec![], tag),
            })
        })
    }

    #[tokio::test]
    async fn test_delivery_to_tracked_clients() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let (a, b, c) = (net.client(), net.client(), net.client());
        let id = ReceptionId::generate(&mut OsRng);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for client in [&a, &b] {
            client.add_identity(id, None, false);
            client.add_service(id, Service::new(vec![], "tag"), Arc::new(Forward(tx.clone())));
        }
        // Registered service but untracked identity
        c.add_service(id, Service::new(vec![], "tag"), Arc::new(Forward(tx.clone())));

        let len = a.max_message_length();
        let sent = a
            .send_with_assembler(id, assembler(len, "tag"), &CmixParams::default())
            .await
            .unwrap();
        assert_eq!(sent.round, RoundId(1));

        for _ in 0..2 {
            let (cell, reception) = rx.recv().await.unwrap();
            assert_eq!(cell.contents.len(), len);
            assert_eq!(reception.service_tag, "tag");
            assert_eq!(reception.ephemeral_id, sent.ephemeral_id);
        }

        a.send_with_assembler(id, assembler(len, "other"), &CmixParams::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_and_bad_size() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let a = net.client();
        let id = ReceptionId::generate(&mut OsRng);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = a
            .send_with_assembler(id, assembler(10, "tag"), &CmixParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::ContentsSize { len: 10, .. }));

        net.set_healthy(false);
        let counter = calls.clone();
        let err = a
            .send_with_assembler(
                id,
                Box::new(move |_: RoundId| -> Result<CellParts, AssemblyError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("unreachable".into())
                }),
                &CmixParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::NotHealthy));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rounds_retried() {
        let net = LoopbackNetwork::new(LoopbackConfig {
            round_period: Duration::from_secs(1),
            ..Default::default()
        });
        let a = net.client();
        let id = ReceptionId::generate(&mut OsRng);
        let len = a.max_message_length();
        let params = CmixParams {
            timeout: Duration::from_millis(4500),
            round_tries: 3,
            ..Default::default()
        };

        net.fail_rounds(2);
        let sent = a
            .send_with_assembler(id, assembler(len, "tag"), &params)
            .await
            .unwrap();
        assert_eq!(sent.round, RoundId(3));

        net.fail_rounds(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = a
            .send_with_assembler(
                id,
                Box::new(move |_: RoundId| -> Result<CellParts, AssemblyError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("unreachable".into())
                }),
                &params,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::NoRound(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Rounds outlast the timeout before the tries run out
        net.fail_rounds(10);
        let params = CmixParams {
            round_tries: 10,
            ..params
        };
        let start = tokio::time::Instant::now();
        let err = a
            .send_with_assembler(id, assembler(len, "tag"), &params)
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::Timeout(t) if t == Duration::from_millis(4500)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(4500) && elapsed < Duration::from_secs(5));
    }
}
