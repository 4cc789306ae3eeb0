//! Modelling identities, mix cells, and channel records with methods to encode and decode them

pub mod cell;
pub mod channel;
pub mod crypto;
pub mod id;
