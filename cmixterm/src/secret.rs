//! Storage of channel owner keys in the host's secret store

use async_trait::async_trait;
use cmix_framework::{model::id::ReceptionId, rsa::RsaPrivateKey};

/// Trait implemented per-platform specifying how to securely store the private keys of the
/// channels owned on this host
#[async_trait]
pub trait SecretStore {
    async fn store(&self, channel: &ReceptionId, key: &RsaPrivateKey) -> bool;

    async fn read(&self, channel: &ReceptionId) -> Option<RsaPrivateKey>;
}

#[cfg(target_os = "linux")]
pub use secserv::SecretServiceStore;

pub use filestore::DerFileStore;

mod filestore {
    use std::path::PathBuf;

    use cmix_framework::rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};

    use super::*;

    /// Owner key storage that encodes every key as a PKCS#8 DER file **without** any additional
    /// protection
    #[derive(Clone, Copy, Debug)]
    pub struct DerFileStore;

    #[async_trait]
    impl SecretStore for DerFileStore {
        async fn store(&self, channel: &ReceptionId, key: &RsaPrivateKey) -> bool {
            if let Err(e) = tokio::fs::create_dir_all(Self::KEY_DIR).await {
                log::warn!("Failed to create private keys folder: {}", e);
            }

            match key.to_pkcs8_der() {
                Ok(der) => match tokio::fs::write(Self::path(channel), der.as_bytes()).await {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("Failed to write owner key to file: {}", e);
                        false
                    }
                },
                Err(e) => {
                    log::error!("Failed to encode owner key as DER: {}", e);
                    false
                }
            }
        }

        async fn read(&self, channel: &ReceptionId) -> Option<RsaPrivateKey> {
            match tokio::fs::read(Self::path(channel)).await {
                Ok(der) => match RsaPrivateKey::from_pkcs8_der(&der) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        log::error!("Failed to decode owner key from PKCS#8 DER: {}", e);
                        None
                    }
                },
                Err(e) => {
                    log::error!("Failed to open owner key file: {}", e);
                    None
                }
            }
        }
    }

    impl DerFileStore {
        const KEY_DIR: &str = "./.key/";

        fn path(channel: &ReceptionId) -> PathBuf {
            PathBuf::from(Self::KEY_DIR).join(format!("{:x}.der", channel))
        }
    }
}

#[cfg(target_os = "linux")]
mod secserv {
    use std::collections::HashMap;

    use super::*;
    use cmix_framework::{FromBytes, ToBytes};
    use secret_service::{Collection, EncryptionType, SecretService};

    /// Owner key storage that saves every key as a secret using the secret service API
    pub struct SecretServiceStore;

    impl SecretServiceStore {
        const CHANNEL_ATTR: &str = "cmix-channel";
        const KEYS_CONTENT_TYPE: &str = "application/pkcs8";

        async fn collection<'a>(
            service: &'a SecretService<'a>,
            create: bool,
        ) -> Option<Collection<'a>> {
            let collection = match service.get_default_collection().await {
                Ok(c) => c,
                Err(secret_service::Error::NoResult) if create => match service
                    .create_collection("Default Keyring", "default")
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("Failed to create default keyring: {}", e);
                        return None;
                    }
                },
                Err(e) => {
                    log::error!("Failed to get collection for owner keys: {}", e);
                    return None;
                }
            };

            if collection.ensure_unlocked().await.is_err() {
                if let Err(e) = collection.unlock().await {
                    log::error!("Failed to unlock owner key collection: {}", e);
                    return None;
                }
            }

            Some(collection)
        }
    }

    #[async_trait]
    impl SecretStore for SecretServiceStore {
        async fn store(&self, channel: &ReceptionId, key: &RsaPrivateKey) -> bool {
            let service = match SecretService::connect(EncryptionType::Dh).await {
                Ok(serv) => serv,
                Err(e) => {
                    log::error!("Failed to connect to secret service provider: {}", e);
                    return false;
                }
            };
            let Some(collection) = Self::collection(&service, true).await else {
                return false;
            };

            let der = match key.encode_to_vec() {
                Ok(v) => v,
                Err(e) => {
                    log::error!("Failed to encode owner key: {}", e);
                    return false;
                }
            };

            let id = format!("{:x}", channel);
            let label = format!("cMix channel owner key {}", channel.short());
            match collection
                .create_item(
                    &label,
                    HashMap::from([(Self::CHANNEL_ATTR, id.as_str())]),
                    &der,
                    true,
                    Self::KEYS_CONTENT_TYPE,
                )
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    log::error!("Failed to create owner key secret: {}", e);
                    false
                }
            }
        }

        async fn read(&self, channel: &ReceptionId) -> Option<RsaPrivateKey> {
            let service = match SecretService::connect(EncryptionType::Dh).await {
                Ok(serv) => serv,
                Err(e) => {
                    log::error!("Failed to connect to secret service provider: {}", e);
                    return None;
                }
            };
            let collection = Self::collection(&service, false).await?;

            let id = format!("{:x}", channel);
            let items = match collection
                .search_items(HashMap::from([(Self::CHANNEL_ATTR, id.as_str())]))
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    log::error!("Failed to search owner keys: {}", e);
                    return None;
                }
            };

            match items.first()?.get_secret().await {
                Ok(der) => match RsaPrivateKey::decode_from_slice(&der) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        log::error!("Failed to decode owner key from secret: {}", e);
                        None
                    }
                },
                Err(e) => {
                    log::error!("Failed to get owner key secret: {}", e);
                    None
                }
            }
        }
    }
}
