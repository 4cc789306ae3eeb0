//! The fixed-size envelope carried through one mix network round

use cmix_wireformat::{FromBytes, ToBytes};

/// Length of the key fingerprint field in a mix cell
pub const KEY_FP_LEN: usize = 25;

/// Length of the MAC field in a mix cell
pub const MAC_LEN: usize = 32;

/// Default total size of a mix cell in bytes
pub const DEFAULT_CELL_SIZE: usize = 2048;

/// Number of contents bytes available in a cell of the given total size
#[inline]
pub const fn contents_len(cell_size: usize) -> usize {
    cell_size.saturating_sub(KEY_FP_LEN + MAC_LEN)
}

/// Identifies which key and nonce a cell was encrypted with so that receivers can route it
/// without trial decryption. The top bit is always clear
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ToBytes, FromBytes)]
pub struct Fingerprint(pub [u8; KEY_FP_LEN]);

impl Fingerprint {
    /// Truncate a digest to fingerprint length, clearing the top bit
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut fp = [0u8; KEY_FP_LEN];
        fp.copy_from_slice(&digest[..KEY_FP_LEN]);
        fp[0] &= 0x7f;
        Self(fp)
    }
}

/// Authentication tag over a cell's contents. The top bit is always clear
#[derive(Clone, Copy, Debug, PartialEq, Eq, ToBytes, FromBytes)]
pub struct Mac(pub [u8; MAC_LEN]);

impl Mac {
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut mac = *digest;
        mac[0] &= 0x7f;
        Self(mac)
    }
}

/// Identifies the processor a cell should be handed to once it is received
#[derive(Clone, Debug, PartialEq, Eq, Hash, ToBytes, FromBytes)]
pub struct Service {
    /// Opaque identifier the service is registered under, usually a reception ID
    pub identifier: Vec<u8>,
    /// Names the kind of processing, i.e. symmetric or asymmetric broadcast
    pub tag: String,
    /// Arbitrary data reported alongside received messages
    pub metadata: Vec<u8>,
}

impl Service {
    pub fn new(identifier: impl Into<Vec<u8>>, tag: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            tag: tag.into(),
            metadata: Vec::new(),
        }
    }
}

/// A mix cell as it travels through the network: fingerprint, MAC, and exactly
/// `cell_size - KEY_FP_LEN - MAC_LEN` contents bytes
#[derive(Clone, Debug, PartialEq, Eq, ToBytes, FromBytes)]
pub struct MixCell {
    pub key_fp: Fingerprint,
    pub mac: Mac,
    pub contents: Vec<u8>,
}

impl MixCell {
    /// Total size of this cell as it would be transmitted
    #[inline]
    pub fn cell_size(&self) -> usize {
        KEY_FP_LEN + MAC_LEN + self.contents.len()
    }
}

/// The product of a message assembler: a filled cell and the service it should be delivered to
#[derive(Clone, Debug)]
pub struct CellParts {
    pub key_fp: Fingerprint,
    pub mac: Mac,
    pub contents: Vec<u8>,
    pub service: Service,
}

impl CellParts {
    pub fn into_cell(self) -> (MixCell, Service) {
        (
            MixCell {
                key_fp: self.key_fp,
                mac: self.mac,
                contents: self.contents,
            },
            self.service,
        )
    }
}
