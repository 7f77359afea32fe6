//! Core data model: `Challenge`, `Solution`, `SubmitJob`, `Account`.

use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, U256};
use std::time::{SystemTime, UNIX_EPOCH};

/// An on-chain-published proof-of-work target plus the current five request ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_hash: H256,
    pub difficulty: U256,
    pub request_ids: [U256; 5],
    pub slot: u8,
    /// Unix seconds after which this challenge is no longer current.
    pub expiration: u64,
}

impl Challenge {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration
    }
}

/// A mined nonce for a specific challenge, produced by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub challenge_hash: H256,
    /// Encoded as a UTF-8 decimal string to match the contract's expected input type.
    pub nonce: String,
    pub difficulty: U256,
    pub request_ids: [U256; 5],
}

/// A `Solution` paired with freshly read indexed values, ready for the Transactor.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub solution: Solution,
    pub request_values: [U256; 5],
}

/// A signer account, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Account {
    pub address: Address,
    pub wallet: LocalWallet,
    pub index: usize,
}

impl Account {
    pub fn new(wallet: LocalWallet, index: usize) -> Self {
        let address = ethers::signers::Signer::address(&wallet);
        Self {
            address,
            wallet,
            index,
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_expiry_is_inclusive_of_now() {
        let c = Challenge {
            challenge_hash: H256::zero(),
            difficulty: U256::one(),
            request_ids: [U256::zero(); 5],
            slot: 1,
            expiration: 100,
        };
        assert!(!c.is_expired(99));
        assert!(c.is_expired(100));
        assert!(c.is_expired(101));
    }
}
