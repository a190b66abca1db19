//! Deterministic deployments through a CREATE2 singleton factory.

use alloy_core::{
    primitives::{Address, B256, Bytes, U256, keccak256},
    sol,
    sol_types::SolCall,
};

use crate::{
    chain::{ChainClient, Receipt, TxRequest, has_code, revert_reason},
    error::{DeployError, Result},
    registry::{AddressRecord, AddressRegistry, ContractKind},
};

sol! {
    /// EIP-2470 singleton factory.
    interface ISingletonFactory {
        function deploy(bytes _initCode, bytes32 _salt) external returns (address payable createdContract);
    }
}

/// Address a CREATE2 deployment of `init_code` through `factory` will land at.
pub fn predict_address(factory: Address, salt: B256, init_code: &[u8]) -> Address {
    factory.create2(salt, keccak256(init_code))
}

/// Salt for a record that must not share an address with siblings deployed from
/// identical init code: `keccak256(salt ++ name)`.
pub fn derive_salt(salt: B256, name: &str) -> B256 {
    let mut preimage = Vec::with_capacity(32 + name.len());
    preimage.extend_from_slice(salt.as_slice());
    preimage.extend_from_slice(name.as_bytes());
    keccak256(preimage)
}

/// One contract to place at a deterministic address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Request {
    /// Registry name the address is recorded under.
    pub name: String,
    pub kind: ContractKind,
    /// Creation bytecode from the artifact.
    pub bytecode: Bytes,
    /// ABI-encoded constructor arguments, appended to the bytecode.
    pub constructor_args: Bytes,
    pub salt: B256,
    /// Requested gas limit, raised to the deployer's floor.
    pub gas_limit: Option<u64>,
}

impl Create2Request {
    pub fn new(name: impl Into<String>, kind: ContractKind, bytecode: Bytes, salt: B256) -> Self {
        Self {
            name: name.into(),
            kind,
            bytecode,
            constructor_args: Bytes::new(),
            salt,
            gas_limit: None,
        }
    }

    pub fn with_constructor_args(mut self, args: impl Into<Bytes>) -> Self {
        self.constructor_args = args.into();
        self
    }

    /// Bytecode followed by constructor arguments.
    pub fn init_code(&self) -> Bytes {
        [self.bytecode.as_ref(), self.constructor_args.as_ref()]
            .concat()
            .into()
    }
}

/// A deployment that still needs its factory transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Submission {
    /// Record to commit once the transaction is confirmed.
    pub record: AddressRecord,
    /// Factory calldata.
    pub calldata: Bytes,
    pub gas_limit: u64,
}

impl Create2Submission {
    pub fn predicted(&self) -> Address {
        self.record.address
    }
}

/// Outcome of [`DeterministicDeployer::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Code is already present at the predicted address.
    AlreadyDeployed(AddressRecord),
    Submit(Create2Submission),
}

/// Computes factory-derived addresses and builds factory transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterministicDeployer {
    factory: Address,
    gas_limit_floor: u64,
}

impl DeterministicDeployer {
    pub fn new(factory: Address, gas_limit_floor: u64) -> Self {
        Self {
            factory,
            gas_limit_floor,
        }
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub fn predict(&self, request: &Create2Request) -> Address {
        predict_address(self.factory, request.salt, &request.init_code())
    }

    /// Resolve a request against the registry and the chain without sending anything.
    ///
    /// Fails before any transaction if the salt was recorded for different init
    /// code or if the name is recorded at another address.
    pub async fn prepare<C: ChainClient>(
        &self,
        client: &C,
        registry: &AddressRegistry,
        request: &Create2Request,
    ) -> Result<Prepared> {
        let init_code = request.init_code();
        let init_code_hash = keccak256(&init_code);
        registry.check_salt(&request.name, request.salt, init_code_hash)?;

        let predicted = self.factory.create2(request.salt, init_code_hash);
        if let Some(recorded) = registry.record(&request.name) {
            if recorded.address != predicted {
                return Err(DeployError::RegistryConflict {
                    name: request.name.clone(),
                    recorded: recorded.address,
                    attempted: predicted,
                });
            }
        }

        let record = AddressRecord::new(&request.name, predicted, request.kind)
            .with_create2(request.salt, init_code_hash);

        if has_code(client, predicted).await? {
            tracing::debug!(name = %request.name, address = %predicted, "Code already present, skipping");
            return Ok(Prepared::AlreadyDeployed(record));
        }

        let calldata = ISingletonFactory::deployCall {
            _initCode: init_code,
            _salt: request.salt,
        }
        .abi_encode();

        Ok(Prepared::Submit(Create2Submission {
            record,
            calldata: calldata.into(),
            gas_limit: request
                .gas_limit
                .map_or(self.gas_limit_floor, |gas| gas.max(self.gas_limit_floor)),
        }))
    }

    /// The factory transaction for a prepared submission.
    pub fn transaction(&self, submission: &Create2Submission, nonce: u64, gas_price: u128) -> TxRequest {
        TxRequest {
            to: Some(self.factory),
            data: submission.calldata.clone(),
            value: U256::ZERO,
            nonce,
            gas_limit: submission.gas_limit,
            gas_price,
        }
    }

    /// Check a mined factory transaction and return the record to commit.
    ///
    /// A reverted transaction is a [`DeployError::DeploymentFailed`]. A
    /// successful one that left no code at the predicted address is a fatal
    /// [`DeployError::AddressMismatch`].
    pub async fn finalize<C: ChainClient>(
        &self,
        client: &C,
        submission: &Create2Submission,
        tx: &TxRequest,
        receipt: &Receipt,
    ) -> Result<AddressRecord> {
        let name = &submission.record.name;
        if !receipt.status {
            return Err(DeployError::DeploymentFailed {
                name: name.clone(),
                reason: revert_reason(client, tx).await,
            });
        }

        let predicted = submission.predicted();
        if !has_code(client, predicted).await? {
            return Err(DeployError::AddressMismatch {
                name: name.clone(),
                predicted,
                actual: format!(
                    "no code was found there after factory transaction {}",
                    receipt.tx_hash
                ),
            });
        }

        tracing::info!(
            name = %name,
            address = %predicted,
            gas_used = receipt.gas_used,
            "Contract deployed"
        );
        Ok(submission.record.clone())
    }

    /// Deploy a single contract with a caller-supplied nonce and record it.
    ///
    /// Running it twice with the same inputs returns the same address and sends
    /// no transaction the second time.
    pub async fn deploy<C: ChainClient>(
        &self,
        client: &C,
        registry: &mut AddressRegistry,
        request: &Create2Request,
        nonce: u64,
        gas_price: u128,
    ) -> Result<Address> {
        let record = match self.prepare(client, registry, request).await? {
            Prepared::AlreadyDeployed(record) => record,
            Prepared::Submit(submission) => {
                let tx = self.transaction(&submission, nonce, gas_price);
                let pending = client.send_transaction(tx.clone()).await.map_err(|e| {
                    DeployError::DeploymentFailed {
                        name: request.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let receipt = client.wait(&pending).await?;
                self.finalize(client, &submission, &tx, &receipt).await?
            }
        };
        let address = record.address;
        registry.insert(record)?;
        Ok(address)
    }
}

/// Deploy the singleton factory itself with a plain contract creation and
/// return the address from the receipt.
pub async fn deploy_factory<C: ChainClient>(
    client: &C,
    bytecode: Bytes,
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
) -> Result<Address> {
    const NAME: &str = "Create2Factory";

    tracing::info!("Deploying Create2 factory");
    let tx = TxRequest {
        to: None,
        data: bytecode,
        value: U256::ZERO,
        nonce,
        gas_limit,
        gas_price,
    };
    let pending = client
        .send_transaction(tx.clone())
        .await
        .map_err(|e| DeployError::DeploymentFailed {
            name: NAME.to_string(),
            reason: e.to_string(),
        })?;
    let receipt = client.wait(&pending).await?;
    if !receipt.status {
        return Err(DeployError::DeploymentFailed {
            name: NAME.to_string(),
            reason: revert_reason(client, &tx).await,
        });
    }
    let address = receipt
        .contract_address
        .ok_or_else(|| DeployError::DeploymentFailed {
            name: NAME.to_string(),
            reason: "receipt carries no contract address".to_string(),
        })?;

    tracing::info!(%address, gas_used = receipt.gas_used, "Create2 factory deployed");
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::{address, b256, hex};

    #[test]
    fn test_predict_address_eip1014_vector() {
        // Example 5 from EIP-1014.
        let factory = address!("00000000000000000000000000000000deadbeef");
        let salt = b256!("00000000000000000000000000000000000000000000000000000000cafebabe");
        let init_code = hex!("deadbeef");
        assert_eq!(
            predict_address(factory, salt, &init_code),
            address!("60f3f640a8508fC6a86d45DF051962668E1e8AC7")
        );
    }

    #[test]
    fn test_constructor_args_change_the_address() {
        let deployer = DeterministicDeployer::new(Address::repeat_byte(0xfa), 1_000);
        let bytecode = Bytes::from_static(&[0x60, 0x80]);
        let base = Create2Request::new("AllowList", ContractKind::Implementation, bytecode, B256::ZERO);
        let with_args = base
            .clone()
            .with_constructor_args(Address::repeat_byte(0x01).into_word().to_vec());

        assert_eq!(deployer.predict(&base), deployer.predict(&base.clone()));
        assert_ne!(deployer.predict(&base), deployer.predict(&with_args));
        assert_eq!(with_args.init_code().len(), 2 + 32);
    }

    #[test]
    fn test_derived_salts_are_distinct_per_name() {
        let salt = B256::repeat_byte(0x42);
        let a = derive_salt(salt, "Bridgehead.BridgeheadProxyAdmin");
        let b = derive_salt(salt, "ProofSystem.ProofSystemProxyAdmin");
        assert_ne!(a, b);
        assert_eq!(a, derive_salt(salt, "Bridgehead.BridgeheadProxyAdmin"));
    }

    #[test]
    fn test_factory_calldata_layout() {
        let calldata = ISingletonFactory::deployCall {
            _initCode: Bytes::from_static(&[0xaa; 3]),
            _salt: B256::repeat_byte(0x01),
        }
        .abi_encode();
        assert_eq!(&calldata[..4], &keccak256("deploy(bytes,bytes32)")[..4]);

        let decoded = ISingletonFactory::deployCall::abi_decode(&calldata, true).unwrap();
        assert_eq!(decoded._salt, B256::repeat_byte(0x01));
        assert_eq!(decoded._initCode.as_ref(), &[0xaa; 3]);
    }
}
