//! Atomic diamond upgrades.

use alloy_core::primitives::{Address, Bytes, U256};

use crate::{
    chain::{ChainClient, Receipt, TxRequest, revert_reason},
    config::TxOptions,
    diamond::{FacetCut, TargetFacet, compute_cut, diamond_cut_calldata, fetch_diamond_state},
    error::{DeployError, Result},
};

const STEP: &str = "diamondCut";

/// Applies a whole cut list plus initializer in a single `diamondCut` call.
///
/// The client's sender must be allowed to cut the diamond (its governor).
/// There is no partial retry: either every facet change and the initializer
/// land together or the diamond is left untouched.
pub struct UpgradeRegistrar<'a, C> {
    client: &'a C,
    diamond: Address,
    tx: TxOptions,
}

impl<'a, C: ChainClient> UpgradeRegistrar<'a, C> {
    pub fn new(client: &'a C, diamond: Address, tx: TxOptions) -> Self {
        Self {
            client,
            diamond,
            tx,
        }
    }

    pub fn diamond(&self) -> Address {
        self.diamond
    }

    /// Compute the cut from the diamond's current facets to `target`.
    pub async fn plan(&self, target: &[TargetFacet]) -> Result<Vec<FacetCut>> {
        let current = fetch_diamond_state(self.client, self.diamond).await?;
        compute_cut(&current, target)
    }

    /// Build the `diamondCut` transaction without sending it.
    pub async fn transaction(
        &self,
        cuts: &[FacetCut],
        init_target: Address,
        init_calldata: Bytes,
    ) -> Result<TxRequest> {
        if init_target.is_zero() && !init_calldata.is_empty() {
            return Err(DeployError::config(
                "initializer calldata given without an initializer address",
            ));
        }
        if cuts.is_empty() && init_target.is_zero() {
            return Err(DeployError::config("upgrade has neither facet cuts nor an initializer"));
        }

        let nonce = match self.tx.nonce {
            Some(nonce) => nonce,
            None => {
                self.client
                    .get_transaction_count(self.client.sender())
                    .await?
            }
        };
        let gas_price = match self.tx.gas_price {
            Some(price) => price,
            None => self.client.get_gas_price().await?,
        };

        Ok(TxRequest {
            to: Some(self.diamond),
            data: diamond_cut_calldata(cuts, init_target, init_calldata),
            value: U256::ZERO,
            nonce,
            gas_limit: self.tx.effective_gas_limit(None),
            gas_price,
        })
    }

    /// Submit the cut and wait for it. A revert is returned with the chain's
    /// reason verbatim.
    pub async fn apply_upgrade(
        &self,
        cuts: &[FacetCut],
        init_target: Address,
        init_calldata: Bytes,
    ) -> Result<Receipt> {
        let tx = self.transaction(cuts, init_target, init_calldata).await?;
        tracing::info!(
            diamond = %self.diamond,
            cuts = cuts.len(),
            init = %init_target,
            nonce = tx.nonce,
            "Submitting diamond cut"
        );

        let pending = self
            .client
            .send_transaction(tx.clone())
            .await
            .map_err(|e| DeployError::TransactionRejected {
                step: STEP.to_string(),
                reason: e.to_string(),
            })?;
        let receipt = self.client.wait(&pending).await?;
        if !receipt.status {
            return Err(DeployError::TransactionRejected {
                step: STEP.to_string(),
                reason: revert_reason(self.client, &tx).await,
            });
        }

        tracing::info!(
            tx_hash = %receipt.tx_hash,
            gas_used = receipt.gas_used,
            "Diamond cut applied"
        );
        Ok(receipt)
    }
}
