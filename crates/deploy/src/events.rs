//! Versioned contract for the registration events read back from receipts.
//!
//! `Bridgehead.newChain` returns nothing usable to an off-chain caller: the new
//! chain id and the contracts created for it are only observable through logs.
//!
//! Layout (version 1):
//! - `NewChain(uint256 indexed chainId, address indexed chainContract)` emitted by
//!   the Bridgehead. `topics[1]` is the chain id, the last 20 bytes of
//!   `topics[2]` are the chain proxy.
//! - `NewProofChain(uint256 indexed chainId, address indexed proofChainContract)`
//!   emitted by the proof system. Same layout, `topics[2]` is the diamond proxy.
//!
//! Changing either signature or the position of a field is a breaking change and
//! must bump [`EVENTS_VERSION`].

use alloy_core::{
    primitives::{Address, B256, U256},
    sol,
    sol_types::SolEvent,
};

use crate::chain::{Log, Receipt};

/// Version of the event layout this module decodes.
pub const EVENTS_VERSION: u32 = 1;

sol! {
    event NewChain(uint256 indexed chainId, address indexed chainContract);
    event NewProofChain(uint256 indexed chainId, address indexed proofChainContract);
}

/// Chain id and contract decoded from a `(uint256 indexed, address indexed)` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedChainEvent {
    pub chain_id: U256,
    pub contract: Address,
}

/// Everything `newChain` announces through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRegistration {
    pub chain_id: U256,
    /// From `NewChain`.
    pub chain_proxy: Address,
    /// From `NewProofChain`.
    pub diamond_proxy: Address,
}

fn find_indexed(logs: &[Log], signature: B256) -> Option<IndexedChainEvent> {
    logs.iter()
        .find(|log| log.topics.first() == Some(&signature) && log.topics.len() >= 3)
        .map(|log| IndexedChainEvent {
            chain_id: U256::from_be_bytes(log.topics[1].0),
            contract: Address::from_word(log.topics[2]),
        })
}

/// First `NewChain` event in the logs.
pub fn find_new_chain(logs: &[Log]) -> Option<IndexedChainEvent> {
    find_indexed(logs, NewChain::SIGNATURE_HASH)
}

/// First `NewProofChain` event in the logs.
pub fn find_new_proof_chain(logs: &[Log]) -> Option<IndexedChainEvent> {
    find_indexed(logs, NewProofChain::SIGNATURE_HASH)
}

/// Decode a `newChain` receipt. Returns the name of the first missing event on failure.
pub fn parse_chain_registration(receipt: &Receipt) -> Result<ChainRegistration, &'static str> {
    let chain = find_new_chain(&receipt.logs).ok_or(NewChain::SIGNATURE)?;
    let proof_chain = find_new_proof_chain(&receipt.logs).ok_or(NewProofChain::SIGNATURE)?;
    if chain.chain_id != proof_chain.chain_id {
        tracing::warn!(
            new_chain = %chain.chain_id,
            new_proof_chain = %proof_chain.chain_id,
            "Registration events disagree on the chain id"
        );
    }
    Ok(ChainRegistration {
        chain_id: chain.chain_id,
        chain_proxy: chain.contract,
        diamond_proxy: proof_chain.contract,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_core::primitives::{Bytes, keccak256};

    pub(crate) fn indexed_log(signature: B256, chain_id: u64, contract: Address) -> Log {
        Log {
            address: Address::repeat_byte(0xbb),
            topics: vec![
                signature,
                B256::from(U256::from(chain_id)),
                contract.into_word(),
            ],
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_event_signatures_are_stable() {
        assert_eq!(
            NewChain::SIGNATURE_HASH,
            keccak256("NewChain(uint256,address)")
        );
        assert_eq!(
            NewProofChain::SIGNATURE_HASH,
            keccak256("NewProofChain(uint256,address)")
        );
    }

    #[test]
    fn test_parse_chain_registration() {
        let chain_proxy = Address::repeat_byte(0x11);
        let diamond_proxy = Address::repeat_byte(0x22);
        let unrelated = Log {
            address: Address::ZERO,
            topics: vec![keccak256("Transfer(address,address,uint256)")],
            data: Bytes::new(),
        };
        let receipt = Receipt {
            tx_hash: B256::ZERO,
            status: true,
            logs: vec![
                unrelated,
                indexed_log(NewProofChain::SIGNATURE_HASH, 270, diamond_proxy),
                indexed_log(NewChain::SIGNATURE_HASH, 270, chain_proxy),
            ],
            gas_used: 0,
            block_number: 1,
            contract_address: None,
        };

        let registration = parse_chain_registration(&receipt).unwrap();
        assert_eq!(registration.chain_id, U256::from(270));
        assert_eq!(registration.chain_proxy, chain_proxy);
        assert_eq!(registration.diamond_proxy, diamond_proxy);
    }

    #[test]
    fn test_missing_event_is_named() {
        let receipt = Receipt {
            tx_hash: B256::ZERO,
            status: true,
            logs: vec![indexed_log(
                NewChain::SIGNATURE_HASH,
                1,
                Address::repeat_byte(0x11),
            )],
            gas_used: 0,
            block_number: 1,
            contract_address: None,
        };
        assert_eq!(
            parse_chain_registration(&receipt),
            Err("NewProofChain(uint256,address)")
        );
    }

    #[test]
    fn test_truncated_topics_are_ignored() {
        let mut log = indexed_log(NewChain::SIGNATURE_HASH, 1, Address::repeat_byte(0x11));
        log.topics.truncate(2);
        assert_eq!(find_new_chain(&[log]), None);
    }
}
