//! Cryptographic primitives backing [`super::EncryptingStorage`]: per-object
//! AES-256-CBC payload encryption with the symmetric key wrapped under an
//! RSA public key (spec §4.3, §6.4).

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{DbError, DbResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;
/// Legacy wrapped-key slot width; correct for RSA-4096 keys, the size this
/// format assumes (spec §4.3: "512-byte wrapped symmetric key").
pub const WRAPPED_KEY_LEN: usize = 512;

pub fn generate_aes_key() -> [u8; AES_KEY_LEN] {
    let mut key = [0u8; AES_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn generate_iv() -> [u8; AES_IV_LEN] {
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

pub fn aes_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn aes_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> DbResult<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| DbError::DecryptionFailed(e.to_string()))
}

/// SHA-256 of the public key's DER-encoded SubjectPublicKeyInfo; identifies
/// which private key a ciphertext's wrapped key was sealed under.
pub fn public_key_hash(public_key: &RsaPublicKey) -> DbResult<[u8; 32]> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| DbError::DecryptionFailed(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(der.as_bytes());
    Ok(hasher.finalize().into())
}

pub fn wrap_key(public_key: &RsaPublicKey, key: &[u8]) -> DbResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, key)
        .map_err(|e| DbError::DecryptionFailed(e.to_string()))
}

pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> DbResult<Vec<u8>> {
    private_key
        .decrypt(Pkcs1v15Encrypt, wrapped)
        .map_err(|e| DbError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn aes_round_trip() {
        let key = generate_aes_key();
        let iv = generate_iv();
        let plaintext = b"hello world";
        let ciphertext = aes_encrypt(&key, &iv, plaintext);
        let decrypted = aes_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rsa_key_wrap_round_trip() {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let key = generate_aes_key();
        let wrapped = wrap_key(&public_key, &key).unwrap();
        let unwrapped = unwrap_key(&private_key, &wrapped).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn public_key_hash_is_deterministic() {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        assert_eq!(
            public_key_hash(&public_key).unwrap(),
            public_key_hash(&public_key).unwrap()
        );
    }
}
