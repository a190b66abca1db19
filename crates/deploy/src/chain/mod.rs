//! Chain access used by the deployment control plane.
//!
//! [`ChainClient`] is the only way the library touches the network. The
//! orchestrator is generic over it so runs can be driven against a JSON-RPC node
//! or an in-memory chain in tests.

mod rpc;

use std::future::Future;

use alloy_core::{
    primitives::{Address, B256, Bytes, U256},
    sol_types::decode_revert_reason,
};

pub use rpc::JsonRpcChainClient;

use crate::error::{DeployError, Result};

/// A fully specified transaction from the client's sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    /// Target contract, `None` for a contract creation.
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// A submitted, not yet confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: B256,
    pub nonce: u64,
}

/// A log entry emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    /// `true` if execution succeeded.
    pub status: bool,
    pub logs: Vec<Log>,
    pub gas_used: u64,
    pub block_number: u64,
    /// Set for contract-creation transactions.
    pub contract_address: Option<Address>,
}

/// A read-only call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

/// Transaction submission, confirmation and state queries for a single signer.
pub trait ChainClient: Send + Sync {
    /// The account every transaction is sent from.
    fn sender(&self) -> Address;

    /// Live transaction count of `address`, including pending transactions.
    fn get_transaction_count(&self, address: Address) -> impl Future<Output = Result<u64>> + Send;

    fn get_code(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send;

    /// Submit a transaction without waiting for it to be mined.
    fn send_transaction(&self, tx: TxRequest) -> impl Future<Output = Result<PendingTx>> + Send;

    /// Wait until the transaction is mined. There is no deadline: abandoning a
    /// pending transaction risks nonce conflicts on retry.
    fn wait(&self, pending: &PendingTx) -> impl Future<Output = Result<Receipt>> + Send;

    fn get_gas_price(&self) -> impl Future<Output = Result<u128>> + Send;

    fn call(&self, call: CallRequest) -> impl Future<Output = Result<Bytes>> + Send;
}

impl<T: ChainClient> ChainClient for &T {
    fn sender(&self) -> Address {
        (**self).sender()
    }

    fn get_transaction_count(&self, address: Address) -> impl Future<Output = Result<u64>> + Send {
        (**self).get_transaction_count(address)
    }

    fn get_code(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send {
        (**self).get_code(address)
    }

    fn send_transaction(&self, tx: TxRequest) -> impl Future<Output = Result<PendingTx>> + Send {
        (**self).send_transaction(tx)
    }

    fn wait(&self, pending: &PendingTx) -> impl Future<Output = Result<Receipt>> + Send {
        (**self).wait(pending)
    }

    fn get_gas_price(&self) -> impl Future<Output = Result<u128>> + Send {
        (**self).get_gas_price()
    }

    fn call(&self, call: CallRequest) -> impl Future<Output = Result<Bytes>> + Send {
        (**self).call(call)
    }
}

/// Best-effort revert reason for a failed transaction, obtained by replaying it
/// as a call.
pub async fn revert_reason<C: ChainClient>(client: &C, tx: &TxRequest) -> String {
    let Some(to) = tx.to else {
        return "contract creation reverted".to_string();
    };
    let call = CallRequest {
        from: Some(client.sender()),
        to,
        data: tx.data.clone(),
    };
    match client.call(call).await {
        Ok(output) => decode_revert_reason(&output)
            .unwrap_or_else(|| "execution reverted (replay succeeded, no reason available)".to_string()),
        Err(DeployError::Rpc { message, .. }) => message,
        Err(e) => e.to_string(),
    }
}

/// Returns `true` if the account has deployed code.
pub async fn has_code<C: ChainClient>(client: &C, address: Address) -> Result<bool> {
    Ok(!client.get_code(address).await?.is_empty())
}
