//! # cMix client core
//!
//! The pieces of a cMix messaging client that sit between the application and the mix network:
//! broadcast channels with symmetric and RSA-authenticated messages, splitting long messages
//! across fixed-size cells, and a key-value store that synchronizes itself between the devices
//! of one user through an untrusted remote store.
//!
//! Channel messaging is reached through the [Context] struct, which should be wrapped in an
//! `Arc`. The synchronized store is [collective::CollectiveKv].

pub mod broadcast;
pub mod cmix;
pub mod collective;
pub(crate) mod ctx;
pub mod kv;
pub mod model;
pub mod partition;
pub mod remote;
pub mod transfer;

pub use ctx::{Context, ContextError};
pub use rsa;

pub use cmix_wireformat::{ByteWriter, FromBytes, FromBytesError, ToBytes, ToBytesError};
