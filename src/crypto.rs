//! Tuya protocol encryption and decryption logic.
//! AES-128-ECB with the per-device local key, framed per protocol revision:
//! 3.3 sends raw ciphertext, 3.1 sends a signed base64 envelope.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};

/// Length of the `3.3` + 12 zero bytes protocol header.
pub const V33_HEADER_LEN: usize = 15;
/// Length of the `3.1` + 16 hex chars signature header.
pub const V31_HEADER_LEN: usize = 19;

/// TuyaCipher provides AES-128-ECB encryption keyed by the device local key.
///
/// The key is fixed at construction; a cipher is never rekeyed.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::InvalidConfig(format!(
                "local key must be 16 bytes, got {}",
                key.len()
            )));
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt a JSON payload for the given protocol revision.
    ///
    /// * 3.3: raw AES-ECB ciphertext.
    /// * 3.1: `3.1` + MD5 signature + base64 ciphertext.
    pub fn encrypt(&self, data: &[u8], version: Version) -> Result<Vec<u8>> {
        let ciphertext = self.encrypt_ecb(data)?;
        match version {
            Version::V3_3 => Ok(ciphertext),
            Version::V3_1 => {
                let b64 = general_purpose::STANDARD.encode(&ciphertext);
                let mut out = version.as_bytes().to_vec();
                out.extend_from_slice(self.v31_signature(b64.as_bytes()).as_bytes());
                out.extend_from_slice(b64.as_bytes());
                Ok(out)
            }
        }
    }

    /// Decrypt a payload received from the device.
    ///
    /// Plain JSON that does not decrypt is passed through unchanged, since
    /// devices answer some queries in clear.
    pub fn decrypt(&self, data: &[u8], version: Version) -> Result<Vec<u8>> {
        let result = match version {
            Version::V3_3 => {
                let body = if has_version_header(data, version) {
                    &data[V33_HEADER_LEN..]
                } else {
                    data
                };
                self.decrypt_ecb(body)
            }
            Version::V3_1 => {
                if has_version_header(data, version) && data.len() >= V31_HEADER_LEN {
                    let b64 = &data[V31_HEADER_LEN..];
                    general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|_| TuyaError::DecryptionFailed)
                        .and_then(|raw| self.decrypt_ecb(&raw))
                } else {
                    Err(TuyaError::DecryptionFailed)
                }
            }
        };

        result.or_else(|e| {
            if data.first() == Some(&b'{') {
                Ok(data.to_vec())
            } else {
                Err(e)
            }
        })
    }

    /// First half of the hex MD5 digest over the signed 3.1 envelope, as
    /// the device expects it.
    fn v31_signature(&self, b64: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(b64);
        hasher.update(b"||lpv=");
        hasher.update(Version::V3_1.as_bytes());
        hasher.update(b"||");
        hasher.update(self.key);
        let digest = hex::encode(hasher.finalize());
        digest[8..24].to_string()
    }

    fn encrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        // Manual PKCS7 padding
        let padding_len = 16 - data.len() % 16;
        let mut ciphertext = data.to_vec();
        ciphertext.resize(data.len() + padding_len, padding_len as u8);

        // Block encryption
        for chunk in ciphertext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        Ok(ciphertext)
    }

    fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut plaintext = data.to_vec();
        for chunk in plaintext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        // Manual PKCS7 unpadding
        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > 16 || pad_len > plaintext.len() {
            return Err(TuyaError::DecryptionFailed);
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::DecryptionFailed);
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }
}

/// True if `payload` starts with the revision's clear-text version tag.
pub fn has_version_header(payload: &[u8], version: Version) -> bool {
    let min_len = match version {
        Version::V3_3 => V33_HEADER_LEN,
        Version::V3_1 => V31_HEADER_LEN,
    };
    payload.len() >= min_len && payload.starts_with(version.as_bytes())
}
