use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use slab::Slab;

use super::{BroadcastError, ListenerFunc, Method};
use crate::{
    cmix::{MessageProcessor, ReceptionInfo, RoundInfo},
    model::{cell::MixCell, channel::Channel},
};

/// Decrypts cells arriving for one channel and method and fans the payload out to every
/// registered listener
pub(crate) struct Processor {
    channel: Arc<Channel>,
    method: Method,
    listeners: Mutex<Slab<ListenerFunc>>,
}

impl Processor {
    pub fn new(channel: Arc<Channel>, method: Method) -> Self {
        Self {
            channel,
            method,
            listeners: Mutex::new(Slab::new()),
        }
    }

    pub fn add_listener(&self, listener: ListenerFunc) -> usize {
        self.listeners.lock().insert(listener)
    }

    pub fn remove_listener(&self, key: usize) -> bool {
        self.listeners.lock().try_remove(key).is_some()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Decrypt a cell that was delivered under `tag`
    pub fn decrypt(&self, cell: &MixCell, tag: &str) -> Result<Vec<u8>, BroadcastError> {
        if tag != self.method.tag() {
            return Err(BroadcastError::WrongMethod {
                expected: self.method,
                found: tag.to_owned(),
            });
        }

        self.method.decrypt(&self.channel, cell)
    }
}

#[async_trait]
impl MessageProcessor for Processor {
    async fn process(&self, cell: MixCell, reception: ReceptionInfo, round: RoundInfo) {
        let payload = match self.decrypt(&cell, &reception.service_tag) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!(
                    "Dropping {:?} broadcast on {} in {}: {}",
                    self.method,
                    self.channel.reception_id().short(),
                    round.id,
                    e
                );
                return;
            }
        };

        let listeners = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();

        log::trace!(
            "{:?} broadcast on {} in {} delivered to {} listeners",
            self.method,
            self.channel.reception_id().short(),
            round.id,
            listeners.len()
        );

        // Each listener runs on its own blocking task so one that stalls or panics leaves the
        // others unaffected
        for listener in listeners {
            let payload = payload.clone();
            let reception = reception.clone();
            tokio::task::spawn_blocking(move || listener(payload, reception, round));
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::{
        broadcast::{symmetric, SYMMETRIC_TAG},
        model::cell::{contents_len, DEFAULT_CELL_SIZE},
    };

    #[test]
    fn test_cell_for_other_method_rejected() {
        let (channel, _) = Channel::new("chan", "d", 1024, &mut OsRng).unwrap();
        let channel = Arc::new(channel);
        let len = contents_len(DEFAULT_CELL_SIZE);
        let payload = vec![7u8; symmetric::max_payload(len)];
        let (cell, service) = symmetric::encrypt(&channel, &payload, len, &mut OsRng)
            .unwrap()
            .into_cell();

        let asymmetric = Processor::new(channel.clone(), Method::Asymmetric);
        match asymmetric.decrypt(&cell, &service.tag) {
            Err(BroadcastError::WrongMethod { expected, found }) => {
                assert_eq!(expected, Method::Asymmetric);
                assert_eq!(found, SYMMETRIC_TAG);
            }
            other => panic!("expected a method mismatch, got {:?}", other),
        }

        let symmetric = Processor::new(channel, Method::Symmetric);
        assert_eq!(symmetric.decrypt(&cell, &service.tag).unwrap(), payload);
    }
}
