use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use alloy_primitives::{Address, B256};
use rand::RngCore;
use scrypt::{Params as ScryptParams, scrypt};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::WalletError;

/// Default scrypt cost, N = 2^13.
pub const DEFAULT_SCRYPT_LOG_N: u8 = 13;

/// Scrypt-AES-GCM encrypted signing key for one account.
///
/// - KDF: scrypt (r=8, p=1, configurable N)
/// - Cipher: AES-256-GCM (authenticated encryption)
///
/// One JSON file per account inside the wallet directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub account: String,
    pub address: Address,
    /// Scrypt salt (32 bytes, hex-encoded).
    pub salt: String,
    /// AES-GCM nonce (12 bytes, hex-encoded).
    pub nonce: String,
    /// Encrypted secp256k1 key (32 bytes plaintext + 16 byte tag, hex-encoded).
    pub ciphertext: String,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

fn derive_key(password: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<[u8; 32], WalletError> {
    let params = ScryptParams::new(log_n, r, p, 32)
        .map_err(|e| WalletError::Keystore(format!("scrypt params: {e}")))?;
    let mut derived = [0u8; 32];
    scrypt(password.as_bytes(), salt, &params, &mut derived)
        .map_err(|e| WalletError::Keystore(format!("scrypt KDF: {e}")))?;
    Ok(derived)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, WalletError> {
    hex::decode(value).map_err(|e| WalletError::Keystore(format!("invalid {field} hex: {e}")))
}

impl KeyFile {
    pub fn encrypt(
        account: &str,
        address: Address,
        secret: &B256,
        password: &str,
        scrypt_log_n: u8,
    ) -> Result<Self, WalletError> {
        let mut salt = [0u8; 32];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let (scrypt_r, scrypt_p) = (8, 1);
        let derived = derive_key(password, &salt, scrypt_log_n, scrypt_r, scrypt_p)?;

        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| WalletError::Keystore(format!("AES init: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_slice())
            .map_err(|e| WalletError::Keystore(format!("AES encrypt: {e}")))?;

        Ok(Self {
            account: account.to_string(),
            address,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
            scrypt_log_n,
            scrypt_r,
            scrypt_p,
        })
    }

    pub fn decrypt(&self, password: &str) -> Result<B256, WalletError> {
        let salt = decode_hex("salt", &self.salt)?;
        let nonce_bytes = decode_hex("nonce", &self.nonce)?;
        let ciphertext = decode_hex("ciphertext", &self.ciphertext)?;
        if nonce_bytes.len() != 12 {
            return Err(WalletError::Keystore(format!("nonce is {} bytes, expected 12", nonce_bytes.len())));
        }

        let derived = derive_key(password, &salt, self.scrypt_log_n, self.scrypt_r, self.scrypt_p)?;
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| WalletError::Keystore(format!("AES init: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| WalletError::Keystore("decryption failed: wrong password or corrupted key file".into()))?;

        B256::try_from(plaintext.as_slice())
            .map_err(|_| WalletError::Keystore(format!("decrypted key is {} bytes, expected 32", plaintext.len())))
    }

    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| WalletError::Keystore(format!("serialize key file: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| WalletError::Keystore(format!("parse key file {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap scrypt cost keeps the tests fast.
    const TEST_LOG_N: u8 = 4;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secret = B256::repeat_byte(0xAB);
        let file = KeyFile::encrypt("account0", Address::ZERO, &secret, "pw-123", TEST_LOG_N).unwrap();
        assert_eq!(file.decrypt("pw-123").unwrap(), secret);
    }

    #[test]
    fn test_wrong_password_fails() {
        let secret = B256::repeat_byte(0xCD);
        let file = KeyFile::encrypt("account0", Address::ZERO, &secret, "correct", TEST_LOG_N).unwrap();
        assert!(matches!(file.decrypt("wrong"), Err(WalletError::Keystore(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let secret = B256::repeat_byte(0xEF);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account1.json");

        let file = KeyFile::encrypt("account1", Address::with_last_byte(1), &secret, "pw", TEST_LOG_N).unwrap();
        file.save(&path).unwrap();

        let loaded = KeyFile::load(&path).unwrap();
        assert_eq!(loaded.account, "account1");
        assert_eq!(loaded.address, Address::with_last_byte(1));
        assert_eq!(loaded.decrypt("pw").unwrap(), secret);
    }
}
