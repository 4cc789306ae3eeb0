//! Routes reassembled messages to listeners registered by message type and/or sender

use std::sync::Arc;

use parking_lot::RwLock;
use slab::Slab;
use tokio::sync::mpsc;

use super::{AssembledMessage, MessageType};
use crate::model::id::ReceptionId;

/// Callback invoked with each matching message
pub type MessageListener = Arc<dyn Fn(&AssembledMessage) + Send + Sync>;

enum Sink {
    Func(MessageListener),
    Channel(mpsc::UnboundedSender<AssembledMessage>),
}

struct Registration {
    sender: Option<ReceptionId>,
    message_type: Option<MessageType>,
    sink: Sink,
}

impl Registration {
    fn matches(&self, message: &AssembledMessage) -> bool {
        self.sender.map_or(true, |s| s == message.sender)
            && self
                .message_type
                .map_or(true, |t| t == message.message_type)
    }
}

/// Handle returned on registration, used to unregister
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SwitchboardId(usize);

#[derive(Default)]
pub struct Switchboard {
    listeners: RwLock<Slab<Registration>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` for every message matching the filters. `None` matches anything
    pub fn register_func<F>(
        &self,
        sender: Option<ReceptionId>,
        message_type: Option<MessageType>,
        listener: F,
    ) -> SwitchboardId
    where
        F: Fn(&AssembledMessage) + Send + Sync + 'static,
    {
        SwitchboardId(self.listeners.write().insert(Registration {
            sender,
            message_type,
            sink: Sink::Func(Arc::new(listener)),
        }))
    }

    /// Forward every message matching the filters to the returned receiver
    pub fn register_channel(
        &self,
        sender: Option<ReceptionId>,
        message_type: Option<MessageType>,
    ) -> (SwitchboardId, mpsc::UnboundedReceiver<AssembledMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.listeners.write().insert(Registration {
            sender,
            message_type,
            sink: Sink::Channel(tx),
        });

        (SwitchboardId(id), rx)
    }

    pub fn unregister(&self, id: SwitchboardId) -> bool {
        self.listeners.write().try_remove(id.0).is_some()
    }

    /// Deliver a message to every matching listener, returning how many received it
    pub fn speak(&self, message: &AssembledMessage) -> usize {
        let mut funcs = Vec::new();
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let listeners = self.listeners.read();
            for (key, registration) in listeners.iter().filter(|(_, r)| r.matches(message)) {
                match &registration.sink {
                    Sink::Func(func) => funcs.push(func.clone()),
                    Sink::Channel(tx) => match tx.send(message.clone()) {
                        Ok(()) => delivered += 1,
                        Err(_) => closed.push(key),
                    },
                }
            }
        }

        if !closed.is_empty() {
            let mut listeners = self.listeners.write();
            for key in closed {
                listeners.try_remove(key);
            }
        }

        // Called outside the lock so that listeners may register or unregister
        for func in funcs {
            func(message);
            delivered += 1;
        }

        if delivered == 0 {
            log::debug!(
                "No listener for {} message {} from {}",
                message.message_type,
                message.full_id,
                message.sender.short()
            );
        }

        delivered
    }
}
