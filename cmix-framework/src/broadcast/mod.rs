//! Sending and receiving broadcasts on a [Channel] over a [CmixClient].
//!
//! A [BroadcastChannel] owns one processor per [Method]; the processor for a method is
//! registered with the network as a service the first time a listener for that method is added.

use std::{fmt, sync::Arc};

use bitflags::bitflags;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;

use crate::{
    cmix::{AssemblyError, CmixClient, CmixError, CmixParams, ReceptionInfo, RoundInfo, SentRound},
    model::{
        cell::{CellParts, MixCell, Service},
        channel::{Channel, ChannelError},
        crypto::CryptoError,
        id::RoundId,
    },
};

pub mod asymmetric;
mod processor;
pub mod sized;
pub mod symmetric;

use processor::Processor;

/// Service tag symmetric broadcasts are delivered under
pub const SYMMETRIC_TAG: &str = "SymmetricBroadcast";
/// Service tag asymmetric broadcasts are delivered under
pub const ASYMMETRIC_TAG: &str = "AsymmetricBroadcast";

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Network is not healthy")]
    NotHealthy,
    #[error("Payload of {len} bytes does not fit, expected {max}")]
    BadSize { len: usize, max: usize },
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Malformed broadcast: {0}")]
    Format(String),
    #[error("{expected:?} processor received a cell tagged {found}")]
    WrongMethod { expected: Method, found: String },
    #[error("Channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("Failed to send: {0}")]
    Send(CmixError),
}

impl From<CmixError> for BroadcastError {
    fn from(e: CmixError) -> Self {
        match e {
            CmixError::NotHealthy => Self::NotHealthy,
            // Errors raised while assembling come back through the transport boxed
            CmixError::Assembly(inner) => match inner.downcast::<BroadcastError>() {
                Ok(broadcast) => *broadcast,
                Err(other) => Self::Send(CmixError::Assembly(other)),
            },
            other => Self::Send(other),
        }
    }
}

/// How a broadcast is encrypted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Symmetric,
    Asymmetric,
}

impl Method {
    /// Service tag cells of this method are delivered under
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Symmetric => SYMMETRIC_TAG,
            Self::Asymmetric => ASYMMETRIC_TAG,
        }
    }

    const fn flag(&self) -> Methods {
        match self {
            Self::Symmetric => Methods::SYMMETRIC,
            Self::Asymmetric => Methods::ASYMMETRIC,
        }
    }

    pub(crate) fn decrypt(&self, channel: &Channel, cell: &MixCell) -> Result<Vec<u8>, BroadcastError> {
        match self {
            Self::Symmetric => symmetric::decrypt(channel, cell),
            Self::Asymmetric => asymmetric::decrypt(channel, cell),
        }
    }
}

bitflags! {
    /// Methods whose processors are registered with the network
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Methods: u8 {
        const SYMMETRIC = 0b01;
        const ASYMMETRIC = 0b10;
    }
}

/// Callback invoked with each decrypted broadcast payload
pub type ListenerFunc = Arc<dyn Fn(Vec<u8>, ReceptionInfo, RoundInfo) + Send + Sync>;

/// Handle to a registered listener, used to unregister it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId {
    method: Method,
    key: usize,
}

/// A joined broadcast channel
pub struct BroadcastChannel {
    channel: Arc<Channel>,
    cmix: Arc<dyn CmixClient>,
    symmetric: Arc<Processor>,
    asymmetric: Arc<Processor>,
    registered: Mutex<Methods>,
}

impl BroadcastChannel {
    /// Join a channel on the given network. Nothing is received until a listener is registered
    pub fn new(channel: Channel, cmix: Arc<dyn CmixClient>) -> Self {
        let channel = Arc::new(channel);
        Self {
            symmetric: Arc::new(Processor::new(channel.clone(), Method::Symmetric)),
            asymmetric: Arc::new(Processor::new(channel.clone(), Method::Asymmetric)),
            channel,
            cmix,
            registered: Mutex::new(Methods::empty()),
        }
    }

    #[inline]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Exact payload size accepted by [BroadcastChannel::broadcast]
    pub fn max_symmetric_payload(&self) -> usize {
        symmetric::max_payload(self.cmix.max_message_length())
    }

    /// Largest payload accepted by [BroadcastChannel::broadcast_rsa_to_public]
    pub fn max_asymmetric_payload(&self) -> Result<usize, BroadcastError> {
        Ok(asymmetric::max_payload(self.channel.rsa_pub_key()?))
    }

    /// Largest payload accepted by [BroadcastChannel::broadcast_sized]
    pub fn max_sized_payload(&self) -> usize {
        sized::max_sized_payload(self.max_symmetric_payload())
    }

    fn processor(&self, method: Method) -> &Arc<Processor> {
        match method {
            Method::Symmetric => &self.symmetric,
            Method::Asymmetric => &self.asymmetric,
        }
    }

    /// Register a callback for every broadcast of `method` received on this channel
    pub fn register_listener<F>(&self, listener: F, method: Method) -> ListenerId
    where
        F: Fn(Vec<u8>, ReceptionInfo, RoundInfo) + Send + Sync + 'static,
    {
        let processor = self.processor(method);
        let key = processor.add_listener(Arc::new(listener));

        let mut registered = self.registered.lock();
        if registered.is_empty() {
            self.cmix
                .add_identity(*self.channel.reception_id(), None, true);
        }
        if !registered.contains(method.flag()) {
            self.cmix.add_service(
                *self.channel.reception_id(),
                Service::new(self.channel.reception_id().as_bytes().to_vec(), method.tag()),
                processor.clone(),
            );
            registered.insert(method.flag());
        }

        ListenerId { method, key }
    }

    /// Remove a listener, returning `false` if it was not registered
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.processor(id.method).remove_listener(id.key)
    }

    /// Stop receiving on this channel, dropping every listener
    pub fn stop(&self) {
        let mut registered = self.registered.lock();
        let id = self.channel.reception_id();
        self.cmix.delete_client_service(id);
        self.cmix.remove_identity(id);
        self.symmetric.clear();
        self.asymmetric.clear();
        *registered = Methods::empty();

        log::debug!("Stopped listening on channel {}", id.short());
    }

    /// Broadcast a payload of exactly [BroadcastChannel::max_symmetric_payload] bytes
    pub async fn broadcast(
        &self,
        payload: Vec<u8>,
        params: &CmixParams,
    ) -> Result<SentRound, BroadcastError> {
        let max = self.max_symmetric_payload();
        if payload.len() != max {
            return Err(BroadcastError::BadSize {
                len: payload.len(),
                max,
            });
        }

        self.broadcast_with_assembler(move |_| Ok(payload), params)
            .await
    }

    /// Broadcast a payload built by `assemble` once the round it will be sent in is known
    pub async fn broadcast_with_assembler<F>(
        &self,
        assemble: F,
        params: &CmixParams,
    ) -> Result<SentRound, BroadcastError>
    where
        F: FnOnce(RoundId) -> Result<Vec<u8>, BroadcastError> + Send + 'static,
    {
        if !self.cmix.is_healthy() {
            return Err(BroadcastError::NotHealthy);
        }

        let channel = self.channel.clone();
        let contents_len = self.cmix.max_message_length();
        let expected = symmetric::max_payload(contents_len);

        let sent = self
            .cmix
            .send_with_assembler(
                *channel.reception_id(),
                Box::new(move |round| -> Result<CellParts, AssemblyError> {
                    let payload = assemble(round)?;
                    if payload.len() != expected {
                        return Err(BroadcastError::BadSize {
                            len: payload.len(),
                            max: expected,
                        }
                        .into());
                    }
                    Ok(symmetric::encrypt(&channel, &payload, contents_len, &mut OsRng)?)
                }),
                params,
            )
            .await?;

        log::debug!(
            "[{}] Symmetric broadcast on {} sent in {}",
            params.debug_tag,
            self.channel.reception_id().short(),
            sent.round
        );

        Ok(sent)
    }

    /// Broadcast any payload up to [BroadcastChannel::max_sized_payload] bytes, framed with a
    /// length prefix and padding
    pub async fn broadcast_sized(
        &self,
        payload: &[u8],
        params: &CmixParams,
    ) -> Result<SentRound, BroadcastError> {
        let sized = sized::encode_sized(payload, self.max_symmetric_payload(), &mut OsRng)?;
        self.broadcast(sized, params).await
    }

    /// Broadcast a payload readable by every member, signed by possession of the channel
    /// owner's private key
    pub async fn broadcast_rsa_to_public(
        &self,
        private: &RsaPrivateKey,
        payload: &[u8],
        params: &CmixParams,
    ) -> Result<SentRound, BroadcastError> {
        if !self.cmix.is_healthy() {
            return Err(BroadcastError::NotHealthy);
        }

        let max = self.max_asymmetric_payload()?;
        if payload.len() > max {
            return Err(BroadcastError::BadSize {
                len: payload.len(),
                max,
            });
        }
        if private.to_public_key() != *self.channel.rsa_pub_key()? {
            return Err(CryptoError::KeyMismatch.into());
        }

        let channel = self.channel.clone();
        let private = private.clone();
        let payload = payload.to_vec();
        let contents_len = self.cmix.max_message_length();

        let sent = self
            .cmix
            .send_with_assembler(
                *channel.reception_id(),
                Box::new(move |_: RoundId| -> Result<CellParts, AssemblyError> {
                    Ok(asymmetric::encrypt(
                        &channel,
                        &private,
                        &payload,
                        contents_len,
                        &mut OsRng,
                    )?)
                }),
                params,
            )
            .await?;

        log::debug!(
            "[{}] Asymmetric broadcast on {} sent in {}",
            params.debug_tag,
            self.channel.reception_id().short(),
            sent.round
        );

        Ok(sent)
    }
}

impl fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("channel", &self.channel)
            .field("registered", &*self.registered.lock())
            .finish_non_exhaustive()
    }
}
