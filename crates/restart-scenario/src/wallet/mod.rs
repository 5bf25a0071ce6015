//! Account key storage and transaction signing.

pub mod keystore;

use alloy_primitives::{Address, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::WalletError;
use crate::ledger::{SignedTransfer, Transfer};

pub use keystore::{DEFAULT_SCRYPT_LOG_N, KeyFile};

/// Holds account signing keys. The orchestrator and its components only ever
/// see addresses; private keys never leave the wallet.
pub trait WalletService: Send + Sync {
    /// Creates (or reopens) the named wallet.
    fn create(&mut self, name: &str) -> Result<(), WalletError>;

    /// Imports the key for `account` and returns its address. Importing the
    /// same account again is a no-op.
    fn import_key(&mut self, account: &str, key: B256) -> Result<Address, WalletError>;

    fn has_key(&self, address: Address) -> bool;

    /// Signs `transfer` with the key of `transfer.from`.
    fn sign(&self, transfer: Transfer) -> Result<SignedTransfer, WalletError>;

    /// Closes the wallet, deleting its files when `remove_files` is set.
    fn shutdown(&mut self, remove_files: bool) -> Result<(), WalletError>;
}

struct OpenWallet {
    name: String,
    password: String,
    /// Keyed by address; value is `(account name, signer)`.
    signers: HashMap<Address, (String, PrivateKeySigner)>,
}

/// [`WalletService`] backed by in-memory signers, optionally mirrored to an
/// encrypted key file per account under `<dir>/<wallet name>/`.
pub struct KeystoreWallet {
    dir: Option<PathBuf>,
    scrypt_log_n: u8,
    open: Option<OpenWallet>,
}

impl KeystoreWallet {
    /// Wallet that never touches disk.
    pub fn in_memory() -> Self {
        Self { dir: None, scrypt_log_n: DEFAULT_SCRYPT_LOG_N, open: None }
    }

    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()), scrypt_log_n: DEFAULT_SCRYPT_LOG_N, open: None }
    }

    pub fn with_scrypt_log_n(mut self, log_n: u8) -> Self {
        self.scrypt_log_n = log_n;
        self
    }

    /// Directory of the open wallet's key files, if persistent.
    pub fn wallet_dir(&self) -> Option<PathBuf> {
        let open = self.open.as_ref()?;
        self.dir.as_ref().map(|d| d.join(&open.name))
    }

    pub fn key_count(&self) -> usize {
        self.open.as_ref().map_or(0, |w| w.signers.len())
    }

    fn open_mut(&mut self) -> Result<&mut OpenWallet, WalletError> {
        self.open.as_mut().ok_or(WalletError::NotCreated)
    }

    fn generate_password() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Loads every key file of an existing wallet directory.
    fn load_existing(
        wallet_dir: &Path,
        password: &str,
    ) -> Result<HashMap<Address, (String, PrivateKeySigner)>, WalletError> {
        let mut signers = HashMap::new();
        for entry in std::fs::read_dir(wallet_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = KeyFile::load(&path)?;
            let secret = file.decrypt(password)?;
            let signer = signer_from_key(&file.account, &secret)?;
            if signer.address() != file.address {
                return Err(WalletError::Keystore(format!(
                    "{} decrypts to {}, file claims {}",
                    path.display(),
                    signer.address(),
                    file.address
                )));
            }
            signers.insert(file.address, (file.account, signer));
        }
        Ok(signers)
    }
}

fn signer_from_key(account: &str, key: &B256) -> Result<PrivateKeySigner, WalletError> {
    PrivateKeySigner::from_bytes(key)
        .map_err(|e| WalletError::InvalidKey { account: account.to_string(), reason: e.to_string() })
}

impl WalletService for KeystoreWallet {
    fn create(&mut self, name: &str) -> Result<(), WalletError> {
        if let Some(open) = &self.open {
            return Err(WalletError::AlreadyOpen(open.name.clone()));
        }

        let Some(root) = &self.dir else {
            self.open = Some(OpenWallet {
                name: name.to_string(),
                password: Self::generate_password(),
                signers: HashMap::new(),
            });
            debug!(wallet = name, "in-memory wallet created");
            return Ok(());
        };

        let wallet_dir = root.join(name);
        let password_path = root.join(format!("{name}.password"));
        let (password, signers) = if password_path.exists() {
            let password = std::fs::read_to_string(&password_path)?.trim().to_string();
            let signers = Self::load_existing(&wallet_dir, &password)?;
            info!(wallet = name, keys = signers.len(), "reopened existing wallet");
            (password, signers)
        } else {
            std::fs::create_dir_all(&wallet_dir)?;
            let password = Self::generate_password();
            std::fs::write(&password_path, &password)?;
            info!(wallet = name, dir = %wallet_dir.display(), "wallet created");
            (password, HashMap::new())
        };

        self.open = Some(OpenWallet { name: name.to_string(), password, signers });
        Ok(())
    }

    fn import_key(&mut self, account: &str, key: B256) -> Result<Address, WalletError> {
        let wallet_dir = self.wallet_dir();
        let log_n = self.scrypt_log_n;
        let open = self.open_mut()?;

        let signer = signer_from_key(account, &key)?;
        let address = signer.address();
        if open.signers.contains_key(&address) {
            return Ok(address);
        }

        if let Some(dir) = wallet_dir {
            let file = KeyFile::encrypt(account, address, &key, &open.password, log_n)?;
            file.save(&dir.join(format!("{account}.json")))?;
        }
        open.signers.insert(address, (account.to_string(), signer));
        debug!(account, %address, "key imported");
        Ok(address)
    }

    fn has_key(&self, address: Address) -> bool {
        self.open.as_ref().is_some_and(|w| w.signers.contains_key(&address))
    }

    fn sign(&self, transfer: Transfer) -> Result<SignedTransfer, WalletError> {
        let open = self.open.as_ref().ok_or(WalletError::NotCreated)?;
        let (_, signer) =
            open.signers.get(&transfer.from).ok_or(WalletError::KeyNotImported(transfer.from))?;
        let signature = signer
            .sign_hash_sync(&transfer.signing_hash())
            .map_err(|e| WalletError::Signing(e.to_string()))?;
        Ok(transfer.into_signed(signature))
    }

    fn shutdown(&mut self, remove_files: bool) -> Result<(), WalletError> {
        let wallet_dir = self.wallet_dir();
        let Some(open) = self.open.take() else {
            return Ok(());
        };

        if remove_files {
            if let (Some(dir), Some(root)) = (wallet_dir, &self.dir) {
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                let password_path = root.join(format!("{}.password", open.name));
                if password_path.exists() {
                    std::fs::remove_file(password_path)?;
                }
            }
        }
        debug!(wallet = %open.name, remove_files, "wallet closed");
        Ok(())
    }
}
