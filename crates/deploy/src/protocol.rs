//! The concrete protocol stack: record names, parameters and the step graph.
//!
//! Hub (Bridgehead), proof system, diamond facets and asset bridges are all
//! deployed through the CREATE2 factory. The chain itself is created by
//! `Bridgehead.newChain`, whose proxies are only known from its events.

use std::collections::BTreeSet;

use alloy_core::{
    primitives::{Address, B256, Bytes, Selector, U256, keccak256},
    sol,
    sol_types::{SolCall, SolValue},
};

use crate::{
    artifacts::ArtifactSource,
    chain::{ChainClient, Receipt, has_code},
    config::{ConfigSource, TxOptions},
    create2::{Create2Request, DeterministicDeployer, deploy_factory},
    diamond::{DiamondState, FacetCut, TargetFacet, compute_cut, cut_data},
    error::{DeployError, Result},
    events::parse_chain_registration,
    orchestrator::{DeploymentPlan, DeploymentStep},
    registry::{AddressRecord, AddressRegistry, ContractKind, EnvBinding},
    upgrade::UpgradeRegistrar,
};

/// Registry names of the stack.
pub mod names {
    pub const ALLOW_LIST: &str = "AllowList";
    pub const CREATE2_FACTORY: &str = "Create2Factory";
    pub const CHAIN_IMPLEMENTATION: &str = "Bridgehead.ChainImplementation";
    pub const CHAIN_PROXY_ADMIN: &str = "Bridgehead.ChainProxyAdmin";
    pub const CHAIN_PROXY: &str = "Bridgehead.ChainProxy";
    pub const BRIDGEHEAD_IMPLEMENTATION: &str = "Bridgehead.BridgeheadImplementation";
    pub const BRIDGEHEAD_PROXY_ADMIN: &str = "Bridgehead.BridgeheadProxyAdmin";
    pub const BRIDGEHEAD_PROXY: &str = "Bridgehead.BridgeheadProxy";
    pub const PROOF_SYSTEM_REGISTRATION: &str = "Bridgehead.ProofSystemRegistration";
    pub const PROOF_SYSTEM_IMPLEMENTATION: &str = "ProofSystem.ProofSystemImplementation";
    pub const PROOF_SYSTEM_PROXY_ADMIN: &str = "ProofSystem.ProofSystemProxyAdmin";
    pub const PROOF_SYSTEM_PROXY: &str = "ProofSystem.ProofSystemProxy";
    pub const VERIFIER: &str = "ProofSystem.Verifier";
    pub const GOVERNANCE_FACET: &str = "ProofSystem.GovernanceFacet";
    pub const EXECUTOR_FACET: &str = "ProofSystem.ExecutorFacet";
    pub const DIAMOND_CUT_FACET: &str = "ProofSystem.DiamondCutFacet";
    pub const GETTERS_FACET: &str = "ProofSystem.GettersFacet";
    pub const DIAMOND_INIT: &str = "ProofSystem.DiamondInit";
    /// Prefix of versioned initializers, see [`super::upgrade_init_name`].
    pub const DIAMOND_UPGRADE_INIT: &str = "ProofSystem.DiamondUpgradeInit";
    pub const DEFAULT_UPGRADE: &str = "ProofSystem.DefaultUpgrade";
    pub const WETH_TOKEN: &str = "WETH9";
    pub const DIAMOND_PROXY: &str = "ProofSystem.DiamondProxy";
    pub const ERC20_BRIDGE_IMPLEMENTATION: &str = "Bridges.ERC20BridgeImplementation";
    pub const ERC20_BRIDGE_PROXY: &str = "Bridges.ERC20BridgeProxy";
    pub const WETH_BRIDGE_IMPLEMENTATION: &str = "Bridges.WethBridgeImplementation";
    pub const WETH_BRIDGE_PROXY: &str = "Bridges.WethBridgeProxy";
    pub const VALIDATOR_TIMELOCK: &str = "ValidatorTimelock";
    pub const MULTICALL3: &str = "Multicall3";

    /// Call steps. They record their outputs under the names above.
    pub const REGISTER_PROOF_SYSTEM: &str = "RegisterProofSystem";
    pub const REGISTER_CHAIN: &str = "RegisterChain";
}

/// Parameter keys read from the deploying environment.
pub mod keys {
    pub const PRIORITY_TX_MAX_GAS_LIMIT: &str = "CONTRACTS_PRIORITY_TX_MAX_GAS_LIMIT";
    pub const GENESIS_ROOT: &str = "CONTRACTS_GENESIS_ROOT";
    pub const GENESIS_ROLLUP_LEAF_INDEX: &str = "CONTRACTS_GENESIS_ROLLUP_LEAF_INDEX";
    pub const GENESIS_BLOCK_COMMITMENT: &str = "CONTRACTS_GENESIS_BLOCK_COMMITMENT";
    pub const RECURSION_NODE_LEVEL_VK_HASH: &str = "CONTRACTS_RECURSION_NODE_LEVEL_VK_HASH";
    pub const RECURSION_LEAF_LEVEL_VK_HASH: &str = "CONTRACTS_RECURSION_LEAF_LEVEL_VK_HASH";
    pub const RECURSION_CIRCUITS_SET_VKS_HASH: &str = "CONTRACTS_RECURSION_CIRCUITS_SET_VKS_HASH";
    pub const BOOTLOADER_HASH: &str = "CHAIN_STATE_KEEPER_BOOTLOADER_HASH";
    pub const DEFAULT_ACCOUNT_HASH: &str = "CHAIN_STATE_KEEPER_DEFAULT_AA_HASH";
    pub const CHAIN_ID: &str = "CHAIN_ETH_ZKSYNC_NETWORK_ID";
    pub const L1_WETH_TOKEN: &str = "CONTRACTS_L1_WETH_TOKEN_ADDR";
    pub const VALIDATOR_TIMELOCK_EXECUTION_DELAY: &str = "CONTRACTS_VALIDATOR_TIMELOCK_EXECUTION_DELAY";
    pub const VALIDATOR: &str = "ETH_SENDER_SENDER_OPERATOR_COMMIT_ETH_ADDR";
}

const fn binding(name: &'static str, env_key: &'static str, kind: ContractKind) -> EnvBinding {
    EnvBinding { name, env_key, kind }
}

/// Record name to env key, in the order downstream env files list them.
pub static ENV_BINDINGS: &[EnvBinding] = &[
    binding(names::ALLOW_LIST, "CONTRACTS_L1_ALLOW_LIST_ADDR", ContractKind::Implementation),
    binding(names::CREATE2_FACTORY, "CONTRACTS_CREATE2_FACTORY_ADDR", ContractKind::Implementation),
    binding(names::CHAIN_IMPLEMENTATION, "CONTRACTS_BRIDGEHEAD_CHAIN_IMPL_ADDR", ContractKind::Implementation),
    binding(names::CHAIN_PROXY_ADMIN, "CONTRACTS_BRIDGEHEAD_CHAIN_PROXY_ADMIN_ADDR", ContractKind::ProxyAdmin),
    binding(names::CHAIN_PROXY, "CONTRACTS_BRIDGEHEAD_CHAIN_PROXY_ADDR", ContractKind::Proxy),
    binding(names::BRIDGEHEAD_IMPLEMENTATION, "CONTRACTS_BRIDGEHEAD_IMPL_ADDR", ContractKind::Implementation),
    binding(names::BRIDGEHEAD_PROXY_ADMIN, "CONTRACTS_BRIDGEHEAD_PROXY_ADMIN_ADDR", ContractKind::ProxyAdmin),
    binding(names::BRIDGEHEAD_PROXY, "CONTRACTS_BRIDGEHEAD_PROXY_ADDR", ContractKind::Proxy),
    binding(names::PROOF_SYSTEM_IMPLEMENTATION, "CONTRACTS_PROOF_SYSTEM_IMPL_ADDR", ContractKind::Implementation),
    binding(names::PROOF_SYSTEM_PROXY_ADMIN, "CONTRACTS_PROOF_SYSTEM_PROXY_ADMIN_ADDR", ContractKind::ProxyAdmin),
    binding(names::PROOF_SYSTEM_PROXY, "CONTRACTS_PROOF_SYSTEM_PROXY_ADDR", ContractKind::Proxy),
    binding(names::VERIFIER, "CONTRACTS_VERIFIER_ADDR", ContractKind::Implementation),
    binding(names::GOVERNANCE_FACET, "CONTRACTS_GOVERNANCE_FACET_ADDR", ContractKind::Implementation),
    binding(names::EXECUTOR_FACET, "CONTRACTS_EXECUTOR_FACET_ADDR", ContractKind::Implementation),
    binding(names::DIAMOND_CUT_FACET, "CONTRACTS_DIAMOND_CUT_FACET_ADDR", ContractKind::Implementation),
    binding(names::GETTERS_FACET, "CONTRACTS_GETTERS_FACET_ADDR", ContractKind::Implementation),
    binding(names::DIAMOND_INIT, "CONTRACTS_DIAMOND_INIT_ADDR", ContractKind::Implementation),
    binding(names::DEFAULT_UPGRADE, "CONTRACTS_DEFAULT_UPGRADE_ADDR", ContractKind::Implementation),
    binding(names::DIAMOND_PROXY, "CONTRACTS_DIAMOND_PROXY_ADDR", ContractKind::Proxy),
    binding(names::ERC20_BRIDGE_IMPLEMENTATION, "CONTRACTS_L1_ERC20_BRIDGE_IMPL_ADDR", ContractKind::Implementation),
    binding(names::ERC20_BRIDGE_PROXY, "CONTRACTS_L1_ERC20_BRIDGE_PROXY_ADDR", ContractKind::Proxy),
    binding(names::WETH_BRIDGE_IMPLEMENTATION, "CONTRACTS_L1_WETH_BRIDGE_IMPL_ADDR", ContractKind::Implementation),
    binding(names::WETH_BRIDGE_PROXY, "CONTRACTS_L1_WETH_BRIDGE_PROXY_ADDR", ContractKind::Proxy),
    binding(names::VALIDATOR_TIMELOCK, "CONTRACTS_VALIDATOR_TIMELOCK_ADDR", ContractKind::Implementation),
    binding(names::MULTICALL3, "CONTRACTS_L1_MULTICALL3_ADDR", ContractKind::Implementation),
    binding(names::WETH_TOKEN, keys::L1_WETH_TOKEN, ContractKind::Implementation),
];

/// The diamond facets, as (record name, artifact name).
pub const FACETS: [(&str, &str); 4] = [
    (names::DIAMOND_CUT_FACET, "DiamondCutFacet"),
    (names::GETTERS_FACET, "GettersFacet"),
    (names::EXECUTOR_FACET, "ExecutorFacet"),
    (names::GOVERNANCE_FACET, "GovernanceFacet"),
];

/// Artifact of the factory deployed when none is configured.
pub const CREATE2_FACTORY_ARTIFACT: &str = "SingletonFactory";

const PROXY_ARTIFACT: &str = "TransparentUpgradeableProxy";
const PROXY_ADMIN_ARTIFACT: &str = "ProxyAdmin";

// Placeholders in the initial `DiamondInit.initialize` call. The proof system
// overwrites them when it creates the chain.
const INIT_BRIDGEHEAD_CHAIN_PLACEHOLDER: Address = Address::new([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x12, 0x34,
]);
const INIT_PROOF_SYSTEM_PLACEHOLDER: Address = Address::new([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x22, 0x34,
]);
const INIT_GOVERNOR_PLACEHOLDER: Address = Address::new([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x32, 0x34,
]);

sol! {
    interface IBridgehead {
        function initialize(
            address _governor,
            address _chainImplementation,
            address _chainProxyAdmin,
            address _allowList,
            uint256 _priorityTxMaxGasLimit
        ) external;

        function newProofSystem(address _proofSystem) external;
    }

    interface IProofSystem {
        function initialize(
            address _bridgehead,
            address _verifier,
            address _governor,
            bytes32 _genesisBatchHash,
            uint64 _genesisIndexRepeatedStorageChanges,
            bytes32 _genesisBatchCommitment,
            address _allowList,
            bytes32 _l2BootloaderBytecodeHash,
            bytes32 _l2DefaultAccountBytecodeHash,
            uint256 _priorityTxMaxGasLimit
        ) external;
    }

    interface IDiamondInit {
        struct VerifierParams {
            bytes32 recursionNodeLevelVkHash;
            bytes32 recursionLeafLevelVkHash;
            bytes32 recursionCircuitsSetVksHash;
        }

        function initialize(
            address _bridgeheadChainContract,
            address _proofSystem,
            address _governor,
            bytes32 _storedBatchZero,
            address _allowList,
            address _verifier,
            VerifierParams _verifierParams,
            bytes32 _l2BootloaderBytecodeHash,
            bytes32 _l2DefaultAccountBytecodeHash,
            uint256 _priorityTxMaxGasLimit
        ) external returns (bytes32);
    }
}

/// `newChain` takes the diamond cut as a nested tuple, encoded by hand so the
/// cut type stays the one from [`crate::diamond`].
const NEW_CHAIN_SIGNATURE: &str =
    "newChain(uint256,address,address,address,((address,uint8,bytes4[])[],address,bytes))";

/// Parameters of a protocol deployment, resolved before anything is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    pub governor: Address,
    pub priority_tx_max_gas_limit: U256,
    pub genesis_root: B256,
    pub genesis_rollup_leaf_index: u64,
    pub genesis_block_commitment: B256,
    pub recursion_node_level_vk_hash: B256,
    pub recursion_leaf_level_vk_hash: B256,
    pub recursion_circuits_set_vks_hash: B256,
    pub bootloader_hash: B256,
    pub default_account_hash: B256,
    /// Requested chain id, `0` lets the Bridgehead assign one.
    pub chain_id: U256,
    /// WETH token of the WETH bridge. Deployed as `WETH9` when not configured.
    pub l1_weth_token: Option<Address>,
    pub validator: Address,
    pub execution_delay: u64,
    pub deploy_multicall3: bool,
}

impl ProtocolParams {
    /// Read every parameter the plan needs. Missing or malformed values are
    /// configuration errors.
    pub fn from_config(source: &dyn ConfigSource, governor: Address, deploy_multicall3: bool) -> Result<Self> {
        let chain_id = match source.get(keys::CHAIN_ID) {
            Some(_) => source.u256(keys::CHAIN_ID)?,
            None => U256::ZERO,
        };
        let l1_weth_token = match source.get(keys::L1_WETH_TOKEN) {
            Some(_) => Some(source.address(keys::L1_WETH_TOKEN)?),
            None => None,
        };
        Ok(Self {
            governor,
            priority_tx_max_gas_limit: source.u256(keys::PRIORITY_TX_MAX_GAS_LIMIT)?,
            genesis_root: source.b256(keys::GENESIS_ROOT)?,
            genesis_rollup_leaf_index: source.u64(keys::GENESIS_ROLLUP_LEAF_INDEX)?,
            genesis_block_commitment: source.b256(keys::GENESIS_BLOCK_COMMITMENT)?,
            recursion_node_level_vk_hash: source.b256(keys::RECURSION_NODE_LEVEL_VK_HASH)?,
            recursion_leaf_level_vk_hash: source.b256(keys::RECURSION_LEAF_LEVEL_VK_HASH)?,
            recursion_circuits_set_vks_hash: source.b256(keys::RECURSION_CIRCUITS_SET_VKS_HASH)?,
            bootloader_hash: source.b256(keys::BOOTLOADER_HASH)?,
            default_account_hash: source.b256(keys::DEFAULT_ACCOUNT_HASH)?,
            chain_id,
            l1_weth_token,
            validator: source.address(keys::VALIDATOR)?,
            execution_delay: source.u64(keys::VALIDATOR_TIMELOCK_EXECUTION_DELAY)?,
            deploy_multicall3,
        })
    }

    fn verifier_params(&self) -> IDiamondInit::VerifierParams {
        IDiamondInit::VerifierParams {
            recursionNodeLevelVkHash: self.recursion_node_level_vk_hash,
            recursionLeafLevelVkHash: self.recursion_leaf_level_vk_hash,
            recursionCircuitsSetVksHash: self.recursion_circuits_set_vks_hash,
        }
    }
}

/// Selectors of each facet, read once when the plan is built.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Deref)]
pub struct FacetSelectors(Vec<(&'static str, BTreeSet<Selector>)>);

impl FacetSelectors {
    pub fn load(artifacts: &dyn ArtifactSource) -> Result<Self> {
        let selectors = FACETS
            .iter()
            .map(|(name, contract)| Ok((*name, artifacts.selectors(contract)?)))
            .collect::<Result<Vec<_>>>()?;
        let facets = Self(selectors);
        // Overlaps are a configuration error whatever the addresses end up being.
        let placeholders: Vec<TargetFacet> = facets
            .iter()
            .enumerate()
            .map(|(i, (name, selectors))| {
                TargetFacet::new(*name, Address::with_last_byte(i as u8 + 1), selectors.iter().copied())
            })
            .collect();
        compute_cut(&DiamondState::empty(), &placeholders)?;
        Ok(facets)
    }

    /// Target facets at their recorded addresses.
    pub fn targets(&self, registry: &AddressRegistry) -> Result<Vec<TargetFacet>> {
        self.iter()
            .map(|(name, selectors)| {
                Ok(TargetFacet::new(*name, registry.get(name)?, selectors.iter().copied()))
            })
            .collect()
    }
}

/// Cut installing every facet on an empty diamond, with `DiamondInit.initialize`.
pub fn initial_diamond_cut(
    registry: &AddressRegistry,
    facets: &FacetSelectors,
    params: &ProtocolParams,
) -> Result<(Vec<FacetCut>, Address, Bytes)> {
    let cuts = compute_cut(&DiamondState::empty(), &facets.targets(registry)?)?;
    let init_calldata = IDiamondInit::initializeCall {
        _bridgeheadChainContract: INIT_BRIDGEHEAD_CHAIN_PLACEHOLDER,
        _proofSystem: INIT_PROOF_SYSTEM_PLACEHOLDER,
        _governor: INIT_GOVERNOR_PLACEHOLDER,
        _storedBatchZero: B256::ZERO,
        _allowList: registry.get(names::ALLOW_LIST)?,
        _verifier: registry.get(names::VERIFIER)?,
        _verifierParams: params.verifier_params(),
        _l2BootloaderBytecodeHash: params.bootloader_hash,
        _l2DefaultAccountBytecodeHash: params.default_account_hash,
        _priorityTxMaxGasLimit: params.priority_tx_max_gas_limit,
    }
    .abi_encode();
    Ok((cuts, registry.get(names::DIAMOND_INIT)?, init_calldata.into()))
}

/// Calldata of `Bridgehead.newChain`.
pub fn new_chain_calldata(
    registry: &AddressRegistry,
    facets: &FacetSelectors,
    params: &ProtocolParams,
) -> Result<Bytes> {
    let (cuts, init, init_calldata) = initial_diamond_cut(registry, facets, params)?;
    let args = (
        params.chain_id,
        registry.get(names::PROOF_SYSTEM_PROXY)?,
        params.governor,
        registry.get(names::ALLOW_LIST)?,
        cut_data(&cuts, init, init_calldata),
    )
        .abi_encode_params();
    Ok([&keccak256(NEW_CHAIN_SIGNATURE)[..4], args.as_slice()]
        .concat()
        .into())
}

/// Constructor arguments of a transparent proxy: implementation, admin, init call.
fn proxy_args(implementation: Address, admin: Address, data: Bytes) -> Bytes {
    (implementation, admin, data).abi_encode_params().into()
}

fn extract_chain_registration(receipt: &Receipt) -> Result<Vec<AddressRecord>> {
    let registration =
        parse_chain_registration(receipt).map_err(|event| DeployError::TransactionRejected {
            step: names::REGISTER_CHAIN.to_string(),
            reason: format!("receipt has no {event} event"),
        })?;
    tracing::info!("CHAIN_ETH_ZKSYNC_NETWORK_ID={}", registration.chain_id);
    Ok(vec![
        AddressRecord::new(names::CHAIN_PROXY, registration.chain_proxy, ContractKind::Proxy),
        AddressRecord::new(names::DIAMOND_PROXY, registration.diamond_proxy, ContractKind::Proxy),
    ])
}

/// The full step graph of the stack.
pub fn protocol_plan(params: &ProtocolParams, artifacts: &dyn ArtifactSource) -> Result<DeploymentPlan> {
    use names::*;

    let p = *params;
    let governor = p.governor;
    let facets = FacetSelectors::load(artifacts)?;

    let mut plan = DeploymentPlan::new()
        .step(
            DeploymentStep::create2(ALLOW_LIST, "AllowList")
                .constructor_args(move |_| Ok((governor,).abi_encode_params().into())),
        )
        .step(DeploymentStep::create2(VERIFIER, "Verifier"));

    for (name, contract) in FACETS {
        plan.push(DeploymentStep::create2(name, contract));
    }
    plan.push(DeploymentStep::create2(DIAMOND_INIT, "DiamondInit"));
    plan.push(DeploymentStep::create2(DEFAULT_UPGRADE, "ProofDefaultUpgrade"));
    if p.deploy_multicall3 {
        plan.push(DeploymentStep::create2(MULTICALL3, "Multicall3"));
    }
    let mut weth_bridge_dependencies = vec![BRIDGEHEAD_PROXY, ALLOW_LIST];
    if p.l1_weth_token.is_none() {
        plan.push(DeploymentStep::create2(WETH_TOKEN, "WETH9"));
        weth_bridge_dependencies.push(WETH_TOKEN);
    }

    plan.push(DeploymentStep::create2(CHAIN_IMPLEMENTATION, "BridgeheadChain"));
    plan.push(DeploymentStep::create2(BRIDGEHEAD_IMPLEMENTATION, "Bridgehead"));
    plan.push(DeploymentStep::create2(PROOF_SYSTEM_IMPLEMENTATION, "ProofSystem"));
    for admin in [CHAIN_PROXY_ADMIN, BRIDGEHEAD_PROXY_ADMIN, PROOF_SYSTEM_PROXY_ADMIN] {
        plan.push(
            DeploymentStep::create2(admin, PROXY_ADMIN_ARTIFACT)
                .kind(ContractKind::ProxyAdmin)
                .derived_salt()
                .constructor_args(move |_| Ok((governor,).abi_encode_params().into())),
        );
    }

    plan.push(
        DeploymentStep::create2(BRIDGEHEAD_PROXY, PROXY_ARTIFACT)
            .kind(ContractKind::Proxy)
            .depends_on([
                BRIDGEHEAD_IMPLEMENTATION,
                BRIDGEHEAD_PROXY_ADMIN,
                CHAIN_IMPLEMENTATION,
                CHAIN_PROXY_ADMIN,
                ALLOW_LIST,
            ])
            .constructor_args(move |registry| {
                let initialize = IBridgehead::initializeCall {
                    _governor: governor,
                    _chainImplementation: registry.get(CHAIN_IMPLEMENTATION)?,
                    _chainProxyAdmin: registry.get(CHAIN_PROXY_ADMIN)?,
                    _allowList: registry.get(ALLOW_LIST)?,
                    _priorityTxMaxGasLimit: p.priority_tx_max_gas_limit,
                }
                .abi_encode();
                Ok(proxy_args(
                    registry.get(BRIDGEHEAD_IMPLEMENTATION)?,
                    registry.get(BRIDGEHEAD_PROXY_ADMIN)?,
                    initialize.into(),
                ))
            }),
    );

    plan.push(
        DeploymentStep::create2(PROOF_SYSTEM_PROXY, PROXY_ARTIFACT)
            .kind(ContractKind::Proxy)
            .depends_on([
                PROOF_SYSTEM_IMPLEMENTATION,
                PROOF_SYSTEM_PROXY_ADMIN,
                BRIDGEHEAD_PROXY,
                VERIFIER,
                ALLOW_LIST,
            ])
            .constructor_args(move |registry| {
                let initialize = IProofSystem::initializeCall {
                    _bridgehead: registry.get(BRIDGEHEAD_PROXY)?,
                    _verifier: registry.get(VERIFIER)?,
                    _governor: governor,
                    _genesisBatchHash: p.genesis_root,
                    _genesisIndexRepeatedStorageChanges: p.genesis_rollup_leaf_index,
                    _genesisBatchCommitment: p.genesis_block_commitment,
                    _allowList: registry.get(ALLOW_LIST)?,
                    _l2BootloaderBytecodeHash: p.bootloader_hash,
                    _l2DefaultAccountBytecodeHash: p.default_account_hash,
                    _priorityTxMaxGasLimit: p.priority_tx_max_gas_limit,
                }
                .abi_encode();
                Ok(proxy_args(
                    registry.get(PROOF_SYSTEM_IMPLEMENTATION)?,
                    registry.get(PROOF_SYSTEM_PROXY_ADMIN)?,
                    initialize.into(),
                ))
            }),
    );

    plan.push(
        DeploymentStep::create2(ERC20_BRIDGE_IMPLEMENTATION, "L1ERC20Bridge")
            .depends_on([BRIDGEHEAD_PROXY, ALLOW_LIST])
            .constructor_args(|registry| {
                Ok((registry.get(BRIDGEHEAD_PROXY)?, registry.get(ALLOW_LIST)?)
                    .abi_encode_params()
                    .into())
            }),
    );
    plan.push(
        DeploymentStep::create2(WETH_BRIDGE_IMPLEMENTATION, "L1WethBridge")
            .depends_on(weth_bridge_dependencies)
            .constructor_args(move |registry| {
                let weth = match p.l1_weth_token {
                    Some(token) => token,
                    None => registry.get(WETH_TOKEN)?,
                };
                Ok((
                    weth,
                    registry.get(BRIDGEHEAD_PROXY)?,
                    registry.get(ALLOW_LIST)?,
                )
                    .abi_encode_params()
                    .into())
            }),
    );
    for (proxy, implementation) in [
        (ERC20_BRIDGE_PROXY, ERC20_BRIDGE_IMPLEMENTATION),
        (WETH_BRIDGE_PROXY, WETH_BRIDGE_IMPLEMENTATION),
    ] {
        plan.push(
            DeploymentStep::create2(proxy, PROXY_ARTIFACT)
                .kind(ContractKind::Proxy)
                .depends_on([implementation])
                .constructor_args(move |registry| {
                    Ok(proxy_args(registry.get(implementation)?, governor, Bytes::new()))
                }),
        );
    }

    plan.push(
        DeploymentStep::call(
            REGISTER_PROOF_SYSTEM,
            [PROOF_SYSTEM_REGISTRATION],
            |registry| registry.get(BRIDGEHEAD_PROXY),
            |registry| {
                Ok(IBridgehead::newProofSystemCall {
                    _proofSystem: registry.get(PROOF_SYSTEM_PROXY)?,
                }
                .abi_encode()
                .into())
            },
            |registry, _receipt| {
                Ok(vec![AddressRecord::new(
                    PROOF_SYSTEM_REGISTRATION,
                    registry.get(PROOF_SYSTEM_PROXY)?,
                    ContractKind::Registration,
                )])
            },
        )
        .depends_on([BRIDGEHEAD_PROXY, PROOF_SYSTEM_PROXY]),
    );

    let mut chain_dependencies = vec![REGISTER_PROOF_SYSTEM, DIAMOND_INIT, VERIFIER, ALLOW_LIST];
    chain_dependencies.extend(FACETS.iter().map(|(name, _)| *name));
    plan.push(
        DeploymentStep::call(
            REGISTER_CHAIN,
            [CHAIN_PROXY, DIAMOND_PROXY],
            |registry| registry.get(BRIDGEHEAD_PROXY),
            move |registry| new_chain_calldata(registry, &facets, &p),
            |_registry, receipt| extract_chain_registration(receipt),
        )
        .depends_on(chain_dependencies),
    );

    plan.push(
        DeploymentStep::create2(VALIDATOR_TIMELOCK, "ValidatorTimelock")
            .depends_on([REGISTER_CHAIN])
            .constructor_args(move |registry| {
                Ok((
                    governor,
                    registry.get(DIAMOND_PROXY)?,
                    p.execution_delay,
                    p.validator,
                )
                    .abi_encode_params()
                    .into())
            }),
    );

    plan.validate()?;
    Ok(plan)
}

/// Make sure a CREATE2 factory exists and is recorded, deploying one if needed.
pub async fn ensure_create2_factory<C: ChainClient>(
    client: &C,
    configured: Option<Address>,
    registry: &mut AddressRegistry,
    artifacts: &dyn ArtifactSource,
    tx: &TxOptions,
) -> Result<Address> {
    let recorded = registry.record(names::CREATE2_FACTORY).map(|record| record.address);

    if let Some(address) = configured.or(recorded) {
        if !has_code(client, address).await? {
            return Err(DeployError::config(format!(
                "no code at Create2 factory {address}; check the RPC endpoint or clear the recorded address"
            )));
        }
        registry.insert(AddressRecord::new(
            names::CREATE2_FACTORY,
            address,
            ContractKind::Implementation,
        ))?;
        return Ok(address);
    }

    let nonce = match tx.nonce {
        Some(nonce) => nonce,
        None => client.get_transaction_count(client.sender()).await?,
    };
    let gas_price = match tx.gas_price {
        Some(price) => price,
        None => client.get_gas_price().await?,
    };
    let address = deploy_factory(
        client,
        artifacts.init_code(CREATE2_FACTORY_ARTIFACT)?,
        nonce,
        tx.effective_gas_limit(None),
        gas_price,
    )
    .await?;
    registry.insert(AddressRecord::new(
        names::CREATE2_FACTORY,
        address,
        ContractKind::Implementation,
    ))?;
    tracing::info!("CONTRACTS_CREATE2_FACTORY_ADDR={address}");
    Ok(address)
}

/// Options of a diamond upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Deploy `DiamondUpgradeInit<N>` and use it as the initializer.
    pub init_version: Option<u32>,
    /// Calldata for the initializer. Must be empty without one.
    pub init_calldata: Bytes,
    /// Compute the cut but do not send it.
    pub dry_run: bool,
}

/// What [`upgrade_diamond`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Facets already match and there is no initializer to run.
    UpToDate,
    /// Dry run: the cut that would be applied.
    Planned { cuts: Vec<FacetCut>, init: Address },
    Applied { cuts: Vec<FacetCut>, init: Address, receipt: Receipt },
}

/// Record name of a versioned upgrade initializer.
pub fn upgrade_init_name(version: u32) -> String {
    format!("{}{version}", names::DIAMOND_UPGRADE_INIT)
}

/// Bring the chain's diamond to the recorded facets.
///
/// The cut is computed from the diamond's live loupe state. The client's
/// sender must be the diamond's governor.
pub async fn upgrade_diamond<C: ChainClient>(
    client: &C,
    registry: &mut AddressRegistry,
    artifacts: &dyn ArtifactSource,
    deployer: &DeterministicDeployer,
    salt: B256,
    tx: &TxOptions,
    options: &UpgradeOptions,
) -> Result<UpgradeOutcome> {
    let diamond = registry.get(names::DIAMOND_PROXY)?;
    let targets = FacetSelectors::load(artifacts)?.targets(registry)?;
    let registrar = UpgradeRegistrar::new(client, diamond, tx.clone());
    let cuts = registrar.plan(&targets).await?;

    if cuts.is_empty() && options.init_version.is_none() {
        tracing::info!(%diamond, "Diamond facets are up to date");
        return Ok(UpgradeOutcome::UpToDate);
    }
    for cut in &cuts {
        tracing::info!(action = %cut.action, facet = %cut.facet, selectors = cut.selectors.len(), "Facet cut");
    }

    let init = match options.init_version {
        Some(version) => {
            let name = upgrade_init_name(version);
            let contract = format!("DiamondUpgradeInit{version}");
            let request = Create2Request::new(
                &name,
                ContractKind::Implementation,
                artifacts.init_code(&contract)?,
                salt,
            );
            if options.dry_run {
                deployer.predict(&request)
            } else {
                let nonce = match tx.nonce {
                    Some(nonce) => nonce,
                    None => client.get_transaction_count(client.sender()).await?,
                };
                let gas_price = match tx.gas_price {
                    Some(price) => price,
                    None => client.get_gas_price().await?,
                };
                let address = deployer
                    .deploy(client, registry, &request, nonce, gas_price)
                    .await?;
                tracing::info!("CONTRACTS_DIAMOND_UPGRADE_INIT_ADDR={address}");
                address
            }
        }
        None => Address::ZERO,
    };

    if options.dry_run {
        return Ok(UpgradeOutcome::Planned { cuts, init });
    }

    // The initializer deployment, if any, consumed the configured nonce.
    let registrar = if options.init_version.is_some() {
        UpgradeRegistrar::new(
            client,
            diamond,
            TxOptions {
                nonce: None,
                ..tx.clone()
            },
        )
    } else {
        registrar
    };
    let receipt = registrar
        .apply_upgrade(&cuts, init, options.init_calldata.clone())
        .await?;
    Ok(UpgradeOutcome::Applied {
        cuts,
        init,
        receipt,
    })
}
