//! RSA keys travel as length-prefixed DER: PKCS#8 for private keys so that they can be stored
//! and reloaded, PKCS#1 for the public keys carried in channel records

use crate::{ByteWriter, FromBytes, FromBytesError, ToBytes, ToBytesError};
use rsa::{
    pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    RsaPrivateKey, RsaPublicKey,
};

fn encode_err<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> ToBytesError + '_ {
    move |e| ToBytesError::InvalidValue(format!("Failed to encode {} as DER: {}", what, e))
}

fn decode_err<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> FromBytesError + '_ {
    move |e| FromBytesError::Parsing(format!("Failed to read {} from DER: {}", what, e))
}

impl ToBytes for RsaPrivateKey {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        let der = self.to_pkcs8_der().map_err(encode_err("private key"))?;
        der.as_bytes().encode(buf)
    }
}

impl FromBytes<'_> for RsaPrivateKey {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        let der = <&[u8] as FromBytes<'_>>::decode(reader)?;
        RsaPrivateKey::from_pkcs8_der(der).map_err(decode_err("private key"))
    }
}

impl ToBytes for RsaPublicKey {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        let der = self.to_pkcs1_der().map_err(encode_err("public key"))?;
        der.as_bytes().encode(buf)
    }
}

impl FromBytes<'_> for RsaPublicKey {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        let der = <&[u8] as FromBytes<'_>>::decode(reader)?;
        RsaPublicKey::from_pkcs1_der(der).map_err(decode_err("public key"))
    }
}
