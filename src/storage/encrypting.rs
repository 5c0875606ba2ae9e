//! Transparent hybrid RSA/AES encrypting wrapper around any [`Storage`]
//! (spec §4.3, §6.4): per-object AES-256-CBC key, RSA-wrapped, framed with a
//! `PSEN` header that identifies which configured private key unwraps it.

use std::collections::HashMap;

use async_trait::async_trait;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{DbError, DbResult};

use super::crypto::{
    aes_decrypt, aes_encrypt, generate_aes_key, generate_iv, public_key_hash, unwrap_key, wrap_key,
    AES_IV_LEN, WRAPPED_KEY_LEN,
};
use super::{ByteStream, ListPage, ObjectInfo, Storage};

pub const PSEN_MAGIC: &[u8; 4] = b"PSEN";
pub const PSEN_VERSION: u32 = 1;
pub const PSEN_TYPE: &[u8; 4] = b"A2CB";
const PSEN_HEADER_LEN: usize = 4 + 4 + 4 + 32;
const LEGACY_HEADER_LEN: usize = WRAPPED_KEY_LEN + AES_IV_LEN;

/// `publicKeyHashHex -> privateKey`; the `"default"` entry is used both for
/// legacy (headerless) payloads and as a literal lookup key, never as a hash.
pub type DecryptionKeyMap = HashMap<String, RsaPrivateKey>;

pub struct EncryptingStorage<S: Storage> {
    inner: S,
    encryption_public_key: Option<RsaPublicKey>,
    decryption_key_map: DecryptionKeyMap,
}

impl<S: Storage> EncryptingStorage<S> {
    pub fn new(
        inner: S,
        encryption_public_key: Option<RsaPublicKey>,
        decryption_key_map: DecryptionKeyMap,
    ) -> Self {
        EncryptingStorage {
            inner,
            encryption_public_key,
            decryption_key_map,
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> DbResult<Vec<u8>> {
        let public_key = match &self.encryption_public_key {
            Some(pk) => pk,
            None => return Ok(plaintext.to_vec()),
        };

        let key = generate_aes_key();
        let iv = generate_iv();
        let ciphertext = aes_encrypt(&key, &iv, plaintext);
        let wrapped = wrap_key(public_key, &key)?;
        if wrapped.len() > WRAPPED_KEY_LEN {
            return Err(DbError::DecryptionFailed(
                "RSA public key too large for the 512-byte wrapped-key slot".to_string(),
            ));
        }
        let hash = public_key_hash(public_key)?;

        let mut out = Vec::with_capacity(PSEN_HEADER_LEN + LEGACY_HEADER_LEN + ciphertext.len());
        out.extend_from_slice(PSEN_MAGIC);
        out.extend_from_slice(&PSEN_VERSION.to_le_bytes());
        out.extend_from_slice(PSEN_TYPE);
        out.extend_from_slice(&hash);
        // Left-pad the wrapped key into the fixed 512-byte legacy slot.
        out.extend(std::iter::repeat(0u8).take(WRAPPED_KEY_LEN - wrapped.len()));
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, bytes: &[u8]) -> DbResult<Vec<u8>> {
        if self.decryption_key_map.is_empty() && self.encryption_public_key.is_none() {
            return Ok(bytes.to_vec());
        }

        if bytes.len() >= PSEN_HEADER_LEN && &bytes[0..4] == PSEN_MAGIC {
            let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            if version != PSEN_VERSION {
                return Err(DbError::UnsupportedVersion(version, PSEN_VERSION));
            }
            let hash_hex = hex::encode(&bytes[12..44]);
            let private_key = self
                .decryption_key_map
                .get(&hash_hex)
                .ok_or_else(|| DbError::NoMatchingKey(hash_hex))?;
            self.unwrap_and_decrypt(private_key, &bytes[PSEN_HEADER_LEN..])
        } else if bytes.len() >= LEGACY_HEADER_LEN {
            let private_key = self
                .decryption_key_map
                .get("default")
                .ok_or_else(|| DbError::NoMatchingKey("default".to_string()))?;
            self.unwrap_and_decrypt(private_key, bytes)
        } else {
            Err(DbError::DecryptionFailed("payload too short to contain a key header".to_string()))
        }
    }

    fn unwrap_and_decrypt(&self, private_key: &RsaPrivateKey, framed: &[u8]) -> DbResult<Vec<u8>> {
        if framed.len() < LEGACY_HEADER_LEN {
            return Err(DbError::DecryptionFailed("truncated key/IV frame".to_string()));
        }
        let modulus_len = private_key.size();
        if modulus_len > WRAPPED_KEY_LEN {
            return Err(DbError::DecryptionFailed("private key exceeds wrapped-key slot".to_string()));
        }
        let wrapped_field = &framed[0..WRAPPED_KEY_LEN];
        let wrapped = &wrapped_field[WRAPPED_KEY_LEN - modulus_len..];
        let iv = &framed[WRAPPED_KEY_LEN..WRAPPED_KEY_LEN + AES_IV_LEN];
        let ciphertext = &framed[WRAPPED_KEY_LEN + AES_IV_LEN..];

        let key = unwrap_key(private_key, wrapped)?;
        aes_decrypt(&key, iv, ciphertext)
    }
}

#[async_trait]
impl<S: Storage> Storage for EncryptingStorage<S> {
    async fn write(&self, path: &str, content_type: Option<&str>, data: Vec<u8>) -> DbResult<()> {
        let encrypted = self.encrypt(&data)?;
        self.inner.write(path, content_type, encrypted).await
    }

    async fn read(&self, path: &str) -> DbResult<Option<Vec<u8>>> {
        match self.inner.read(path).await? {
            Some(bytes) => Ok(Some(self.decrypt(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_stream(&self, path: &str, content_type: Option<&str>, stream: ByteStream) -> DbResult<()> {
        use futures::StreamExt;
        let mut buf = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.write(path, content_type, buf).await
    }

    async fn read_stream(&self, path: &str) -> DbResult<ByteStream> {
        let data = self.read(path).await?.ok_or_else(|| DbError::NotFound(path.to_string()))?;
        let stream = futures::stream::once(async move { Ok(bytes::Bytes::from(data)) });
        Ok(Box::pin(stream))
    }

    async fn info(&self, path: &str) -> DbResult<Option<ObjectInfo>> {
        // Report the plaintext length, not the framed on-disk length.
        match self.read(path).await? {
            Some(data) => {
                let last_modified = self.inner.info(path).await?.map(|i| i.last_modified).unwrap_or(0);
                Ok(Some(ObjectInfo {
                    content_type: None,
                    length: data.len() as u64,
                    last_modified,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_file(&self, path: &str) -> DbResult<()> {
        self.inner.delete_file(path).await
    }

    async fn list_files(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        self.inner.list_files(prefix, limit, cursor).await
    }

    async fn list_dirs(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        self.inner.list_dirs(prefix, limit, cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFsStorage;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    }

    #[tokio::test]
    async fn round_trip_with_psen_header() {
        let dir = TempDir::new().unwrap();
        let (private_key, public_key) = keypair();
        let hash_hex = hex::encode(public_key_hash(&public_key).unwrap());
        let mut map = DecryptionKeyMap::new();
        map.insert(hash_hex, private_key);

        let storage = EncryptingStorage::new(LocalFsStorage::new(dir.path()), Some(public_key), map);
        storage.write("blob", None, b"hello world".to_vec()).await.unwrap();

        let raw = tokio::fs::read(dir.path().join("blob")).await.unwrap();
        assert_eq!(&raw[0..4], PSEN_MAGIC);

        let data = storage.read("blob").await.unwrap().unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn key_rotation_keeps_old_ciphertexts_readable() {
        let dir = TempDir::new().unwrap();
        let (old_priv, old_pub) = keypair();
        let (new_priv, new_pub) = keypair();

        let old_hash = hex::encode(public_key_hash(&old_pub).unwrap());
        let new_hash = hex::encode(public_key_hash(&new_pub).unwrap());
        let mut map = DecryptionKeyMap::new();
        map.insert(old_hash, old_priv);
        map.insert(new_hash, new_priv);

        let old_storage = EncryptingStorage::new(LocalFsStorage::new(dir.path()), Some(old_pub), map.clone());
        old_storage.write("a", None, b"old write".to_vec()).await.unwrap();

        let new_storage = EncryptingStorage::new(LocalFsStorage::new(dir.path()), Some(new_pub), map);
        new_storage.write("b", None, b"new write".to_vec()).await.unwrap();

        assert_eq!(new_storage.read("a").await.unwrap().unwrap(), b"old write");
        assert_eq!(new_storage.read("b").await.unwrap().unwrap(), b"new write");
    }

    #[tokio::test]
    async fn missing_key_surfaces_no_matching_key() {
        let dir = TempDir::new().unwrap();
        let (_priv_a, pub_a) = keypair();
        let (priv_b, _pub_b) = keypair();
        let mut map = DecryptionKeyMap::new();
        map.insert("only-b".to_string(), priv_b);

        let storage = EncryptingStorage::new(LocalFsStorage::new(dir.path()), Some(pub_a), map);
        storage.write("blob", None, b"secret".to_vec()).await.unwrap();
        let result = storage.read("blob").await;
        assert!(matches!(result, Err(DbError::NoMatchingKey(_))));
    }
}
