//! Ledger-facing value types shared by the supervisor, wallet and workload.

use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, B256, Bytes, Signature, TxKind, U256, keccak256};
use alloy_signer_local::PrivateKeySigner;

use crate::config::LedgerSettings;
use crate::error::WalletError;

/// An on-chain account used by the scenario. The signing key lives only in
/// the wallet; `address` is the reference to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    /// Participant that owns the account.
    pub owner: String,
    pub address: Address,
}

/// Deterministic private key for a named account, `keccak256("restart-scenario-key-{name}")`.
///
/// Accounts are reproducible across runs so a reused cluster recognises
/// previously created accounts.
pub fn deterministic_key(name: &str) -> B256 {
    keccak256(format!("restart-scenario-key-{name}").as_bytes())
}

/// Address of [`deterministic_key`], needed for the genesis allocation
/// before any wallet exists.
pub fn deterministic_address(name: &str) -> Result<Address, WalletError> {
    PrivateKeySigner::from_bytes(&deterministic_key(name))
        .map(|signer| signer.address())
        .map_err(|e| WalletError::InvalidKey { account: name.to_string(), reason: e.to_string() })
}

/// Participant account names, `account0..accountN`.
pub fn participant_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("account{i}")).collect()
}

/// Balance and nonce of one address as seen by one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: U256,
    pub nonce: u64,
}

impl AccountState {
    /// An address the ledger has never touched reads as zero/zero.
    pub fn exists(&self) -> bool {
        !self.balance.is_zero() || self.nonce > 0
    }
}

/// Outcome of an included transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: B256,
    pub block_height: u64,
    pub success: bool,
    /// Total fee debited from the sender.
    pub fee: U256,
}

/// An unsigned value transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl Transfer {
    pub fn new(ledger: &LedgerSettings, from: Address, to: Address, value: U256, nonce: u64) -> Self {
        Self {
            chain_id: ledger.chain_id,
            from,
            to,
            value,
            nonce,
            gas_limit: ledger.gas_limit,
            max_fee_per_gas: ledger.max_fee_per_gas,
            max_priority_fee_per_gas: ledger.max_priority_fee_per_gas,
        }
    }

    pub fn to_eip1559(&self) -> TxEip1559 {
        TxEip1559 {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            to: TxKind::Call(self.to),
            value: self.value,
            input: Bytes::default(),
            access_list: Default::default(),
        }
    }

    /// The prehash the sender's key signs.
    pub fn signing_hash(&self) -> B256 {
        self.to_eip1559().signature_hash()
    }

    /// Attaches a signature and produces the EIP-2718 wire encoding.
    pub fn into_signed(self, signature: Signature) -> SignedTransfer {
        let signed = self.to_eip1559().into_signed(signature);
        let mut raw = Vec::new();
        signed.encode_2718(&mut raw);
        SignedTransfer { hash: *signed.hash(), transfer: self, signature, raw }
    }
}

#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub hash: B256,
    pub transfer: Transfer,
    pub signature: Signature,
    /// EIP-2718 envelope for `eth_sendRawTransaction`.
    pub raw: Vec<u8>,
}

impl SignedTransfer {
    /// Recovers the signer and checks it matches `transfer.from`.
    pub fn verify(&self) -> bool {
        self.signature
            .recover_address_from_prehash(&self.transfer.signing_hash())
            .map(|signer| signer == self.transfer.from)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;

    #[test]
    fn test_deterministic_keys_stable_and_unique() {
        assert_eq!(deterministic_key("account0"), deterministic_key("account0"));
        assert_ne!(deterministic_key("account0"), deterministic_key("account1"));
    }

    #[test]
    fn test_deterministic_address_matches_key() {
        let signer = PrivateKeySigner::from_bytes(&deterministic_key("genesis")).unwrap();
        assert_eq!(deterministic_address("genesis").unwrap(), signer.address());
    }

    #[test]
    fn test_participant_names() {
        assert_eq!(participant_names(3), vec!["account0", "account1", "account2"]);
    }

    #[test]
    fn test_account_state_exists() {
        assert!(!AccountState::default().exists());
        assert!(AccountState { balance: U256::from(1), nonce: 0 }.exists());
        assert!(AccountState { balance: U256::ZERO, nonce: 2 }.exists());
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let signer = PrivateKeySigner::from_bytes(&deterministic_key("account0")).unwrap();
        let other = PrivateKeySigner::from_bytes(&deterministic_key("account1")).unwrap();
        let transfer = Transfer::new(
            &LedgerSettings::default(),
            signer.address(),
            other.address(),
            U256::from(5),
            0,
        );

        let sig = signer.sign_hash_sync(&transfer.signing_hash()).unwrap();
        let signed = transfer.clone().into_signed(sig);
        assert!(signed.verify());
        assert!(!signed.raw.is_empty());

        // Signed by the wrong key.
        let forged_sig = other.sign_hash_sync(&transfer.signing_hash()).unwrap();
        assert!(!transfer.into_signed(forged_sig).verify());
    }
}
