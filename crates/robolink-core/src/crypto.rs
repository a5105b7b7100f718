//! Frame crypto
//!
//! Two primitives protect frames on the wire:
//! - an integrity tag on every frame (truncated HMAC-SHA256 keyed by the device's local key)
//! - AES-128-GCM sealing of secure payloads, with the key bound to the device's current
//!   handshake nonce

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size of the integrity tag appended to every frame
pub const TAG_SIZE: usize = 4;

/// Size of the GCM initialisation vector
pub const IV_SIZE: usize = 12;

/// Compute the truncated integrity tag over `data`
pub fn integrity_tag(local_key: &[u8], data: &[u8]) -> Result<[u8; TAG_SIZE]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(local_key)
        .map_err(|e| Error::Encryption(e.to_string()))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&digest[..TAG_SIZE]);
    Ok(tag)
}

/// Check a truncated integrity tag in constant time
pub fn verify_integrity(local_key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(local_key) else {
        return false;
    };
    mac.update(data);
    mac.verify_truncated_left(tag).is_ok()
}

/// Build the per-frame IV from header fields
pub fn frame_iv(seq: u32, random: u32, timestamp: u32) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[..4].copy_from_slice(&seq.to_be_bytes());
    iv[4..8].copy_from_slice(&random.to_be_bytes());
    iv[8..].copy_from_slice(&timestamp.to_be_bytes());
    iv
}

/// Payload cipher bound to one (local key, nonce) pair
pub struct SessionCipher {
    cipher: Aes128Gcm,
}

impl SessionCipher {
    pub fn new(local_key: &[u8], nonce: u64) -> Result<Self> {
        let key = derive_session_key(local_key, nonce);
        let cipher =
            Aes128Gcm::new_from_slice(&key).map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, iv: &[u8; IV_SIZE], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))
    }

    pub fn open(&self, iv: &[u8; IV_SIZE], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::malformed("payload authentication failed"))
    }
}

fn derive_session_key(local_key: &[u8], nonce: u64) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(local_key);
    hasher.update(nonce.to_be_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}
