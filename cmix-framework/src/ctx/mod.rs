use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use crate::{
    broadcast::{sized, symmetric, BroadcastChannel, BroadcastError, ListenerId, Method},
    cmix::{CmixClient, CmixParams, SentRound},
    model::{
        channel::Channel,
        crypto::sha256,
        id::{ReceptionId, ID_LEN, USER_ID_TYPE},
    },
    partition::{
        AssembledMessage, MessageType, PartitionConfig, PartitionError, Partitioner, Switchboard,
        SwitchboardId,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Channel {0} has not been joined")]
    UnknownChannel(ReceptionId),
    #[error("Partition: {0}")]
    Partition(#[from] PartitionError),
    #[error("Broadcast: {0}")]
    Broadcast(#[from] BroadcastError),
}

struct Joined {
    channel: Arc<BroadcastChannel>,
    listener: ListenerId,
}

/// The main interface of the client core: joins broadcast channels and exchanges arbitrarily
/// long messages on them, split into parts that each fill one symmetric broadcast.
///
/// Every part is prefixed with the sending context's member ID so that the parts of
/// concurrently sending members are reassembled separately.
pub struct Context {
    cmix: Arc<dyn CmixClient>,
    /// Identifies this context as a sender on every channel
    member: ReceptionId,
    partitioner: Arc<Partitioner>,
    switchboard: Arc<Switchboard>,
    channels: DashMap<ReceptionId, Joined>,
}

/// Identity messages from `member` on `channel` are reassembled under
fn sender_id(channel: &ReceptionId, member: &ReceptionId) -> ReceptionId {
    let digest = sha256(&[channel.as_bytes(), member.as_bytes()]);
    let mut body = [0u8; ID_LEN - 1];
    body.copy_from_slice(&digest[..ID_LEN - 1]);
    ReceptionId::new(body, USER_ID_TYPE)
}

impl Context {
    /// Create a context sending and receiving over `cmix`
    pub fn new(cmix: Arc<dyn CmixClient>) -> Arc<Self> {
        let outer = sized::max_sized_payload(symmetric::max_payload(cmix.max_message_length()));
        let partitioner = Partitioner::new(PartitionConfig {
            part_size: outer.saturating_sub(ID_LEN),
            ..Default::default()
        });

        let member = ReceptionId::generate(&mut OsRng);
        log::debug!("Created context with member ID {}", member.short());

        Arc::new(Self {
            cmix,
            member,
            partitioner: Arc::new(partitioner),
            switchboard: Arc::new(Switchboard::new()),
            channels: DashMap::new(),
        })
    }

    #[inline]
    pub fn cmix(&self) -> &Arc<dyn CmixClient> {
        &self.cmix
    }

    #[inline]
    pub const fn member_id(&self) -> &ReceptionId {
        &self.member
    }

    #[inline]
    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    #[inline]
    pub fn switchboard(&self) -> &Switchboard {
        &self.switchboard
    }

    /// Start receiving messages on a channel, returning its broadcast handle. Joining a channel
    /// twice returns the existing handle
    pub fn join_channel(&self, channel: Channel) -> Arc<BroadcastChannel> {
        let id = *channel.reception_id();
        if let Some(joined) = self.channels.get(&id) {
            return joined.channel.clone();
        }

        let broadcast = Arc::new(BroadcastChannel::new(channel, self.cmix.clone()));
        let partitioner = self.partitioner.clone();
        let switchboard = self.switchboard.clone();

        let listener = broadcast.register_listener(
            move |payload, _, _| {
                let framed = match sized::decode_sized(&payload) {
                    Ok(framed) if framed.len() > ID_LEN => framed,
                    Ok(_) => {
                        log::warn!("Dropping short message on channel {}", id.short());
                        return;
                    }
                    Err(e) => {
                        log::warn!("Dropping malformed message on channel {}: {}", id.short(), e);
                        return;
                    }
                };

                let (member, part) = framed.split_at(ID_LEN);
                let mut member_id = [0u8; ID_LEN];
                member_id.copy_from_slice(member);
                let sender = sender_id(&id, &ReceptionId(member_id));

                match partitioner.handle_partition(&sender, part) {
                    Ok(Some(message)) => {
                        let heard = switchboard.speak(&message);
                        log::trace!("{} reached {} listeners", message.message_type, heard);
                    }
                    Ok(None) => (),
                    Err(e) => log::warn!("Dropping part on channel {}: {}", id.short(), e),
                }
            },
            Method::Symmetric,
        );

        log::info!("Joined channel {}", id.short());
        self.channels.insert(
            id,
            Joined {
                channel: broadcast.clone(),
                listener,
            },
        );
        broadcast
    }

    /// Stop receiving on a channel
    pub fn leave_channel(&self, id: &ReceptionId) -> bool {
        match self.channels.remove(id) {
            Some((_, joined)) => {
                joined.channel.unregister_listener(joined.listener);
                joined.channel.stop();
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, id: &ReceptionId) -> Option<Arc<BroadcastChannel>> {
        self.channels.get(id).map(|joined| joined.channel.clone())
    }

    /// Largest message [Context::broadcast_message] accepts
    pub fn max_message_len(&self) -> usize {
        self.partitioner.max_payload()
    }

    /// Send a message of any length up to [Context::max_message_len] to every member of a
    /// joined channel, one broadcast per part
    pub async fn broadcast_message(
        &self,
        channel: &ReceptionId,
        message_type: MessageType,
        payload: &[u8],
        params: &CmixParams,
    ) -> Result<Vec<SentRound>, ContextError> {
        let broadcast = self
            .channel(channel)
            .ok_or(ContextError::UnknownChannel(*channel))?;

        let partitioned = self.partitioner.partition(
            channel,
            message_type,
            Utc::now().timestamp_millis(),
            payload,
        )?;

        let mut rounds = Vec::with_capacity(partitioned.parts.len());
        for part in partitioned.parts {
            let mut framed = Vec::with_capacity(ID_LEN + part.len());
            framed.extend_from_slice(self.member.as_bytes());
            framed.extend_from_slice(&part);
            rounds.push(broadcast.broadcast_sized(&framed, params).await?);
        }

        log::debug!(
            "[{}] Sent message {} on {} in {} parts",
            params.debug_tag,
            partitioned.full_id,
            channel.short(),
            rounds.len()
        );
        Ok(rounds)
    }

    /// Receive every reassembled message matching the filters through a channel
    pub fn listen_for_messages(
        &self,
        message_type: Option<MessageType>,
    ) -> (SwitchboardId, mpsc::UnboundedReceiver<AssembledMessage>) {
        self.switchboard.register_channel(None, message_type)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cmix::{LoopbackConfig, LoopbackNetwork};

    #[tokio::test]
    async fn test_long_message_between_contexts() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let alice = Context::new(Arc::new(net.client()));
        let bob = Context::new(Arc::new(net.client()));

        let channel = Channel::from_parts("chat", "a test channel", [1; 32], [2; 32], [3; 32]).unwrap();
        let id = *channel.reception_id();
        alice.join_channel(channel.clone());
        bob.join_channel(channel);

        let (_, mut inbox) = bob.listen_for_messages(Some(MessageType::XxMessage));
        let payload = (0..5000u32).map(|i| i as u8).collect::<Vec<_>>();
        let rounds = alice
            .broadcast_message(&id, MessageType::XxMessage, &payload, &CmixParams::default())
            .await
            .unwrap();
        assert!(rounds.len() > 1);

        let message = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, payload);
        assert_eq!(message.message_type, MessageType::XxMessage);
        assert_eq!(message.sender, sender_id(&id, alice.member_id()));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let ctx = Context::new(Arc::new(net.client()));
        let id = ReceptionId::generate(&mut OsRng);
        assert!(matches!(
            ctx.broadcast_message(&id, MessageType::NoType, b"hi", &CmixParams::default())
                .await,
            Err(ContextError::UnknownChannel(_))
        ));
        assert!(!ctx.leave_channel(&id));
    }
}
