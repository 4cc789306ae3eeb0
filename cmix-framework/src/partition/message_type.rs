use std::fmt;

/// Stable numeric tags identifying what an application payload contains
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageType {
    NoType,
    XxMessage,
    KeyExchangeTrigger,
    KeyExchangeConfirm,
    GroupCreationRequest,
    NewFileTransfer,
    EndFileTransfer,
    ConnectionAuthenticationRequest,
    /// Any tag without a known meaning, carried through unchanged.
    /// Only produced by [From<u32>], so it never holds a known tag
    Reserved(u32),
}

impl From<u32> for MessageType {
    fn from(tag: u32) -> Self {
        match tag {
            0 => Self::NoType,
            2 => Self::XxMessage,
            30 => Self::KeyExchangeTrigger,
            31 => Self::KeyExchangeConfirm,
            40 => Self::GroupCreationRequest,
            50 => Self::NewFileTransfer,
            51 => Self::EndFileTransfer,
            60 => Self::ConnectionAuthenticationRequest,
            other => Self::Reserved(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(ty: MessageType) -> Self {
        match ty {
            MessageType::NoType => 0,
            MessageType::XxMessage => 2,
            MessageType::KeyExchangeTrigger => 30,
            MessageType::KeyExchangeConfirm => 31,
            MessageType::GroupCreationRequest => 40,
            MessageType::NewFileTransfer => 50,
            MessageType::EndFileTransfer => 51,
            MessageType::ConnectionAuthenticationRequest => 60,
            MessageType::Reserved(tag) => tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved(tag) => write!(f, "Reserved({})", tag),
            other => write!(f, "{:?}", other),
        }
    }
}
