//! Shared fixtures: an in-memory chain and the protocol's artifacts and parameters.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::{Arc, Mutex},
};

use alloy_core::{
    primitives::{Address, B256, Bytes, Selector, U256, keccak256},
    sol_types::{SolCall, SolEvent, SolValue},
};
use bridgehead_deploy::{
    CallRequest, ChainClient, DeployError, DeployerSettings, Log, PendingTx, Receipt, Result,
    StaticArtifactSource, TxOptions, TxRequest,
    create2::ISingletonFactory,
    diamond::{IDiamondCut, IDiamondLoupe},
    events::{NewChain, NewProofChain},
    protocol::{FACETS, keys},
};
use url::Url;

pub const SENDER: Address = Address::repeat_byte(0xde);
pub const SALT: B256 = B256::repeat_byte(0x5a);
pub const GAS_PRICE: u128 = 1_000_000_000;

/// Runtime code the mock treats as a CREATE2 singleton factory.
pub const FACTORY_CODE: &[u8] = &[0xfa, 0xc7, 0x02];

const NEW_CHAIN_SIGNATURE: &str =
    "newChain(uint256,address,address,address,((address,uint8,bytes4[])[],address,bytes))";

pub fn selector(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature)[..4])
}

pub type Facets = Vec<(Address, Vec<Selector>)>;

#[derive(Debug, Default)]
struct State {
    nonce: u64,
    code: HashMap<Address, Bytes>,
    sent: Vec<TxRequest>,
    receipts: HashMap<B256, Receipt>,
    rejected_nonces: BTreeSet<u64>,
    reverting_init_code: Vec<Bytes>,
    reverting_calls: HashMap<(Address, Selector), String>,
    discard_factory_code: bool,
    facets: HashMap<Address, Facets>,
    chains: u64,
}

/// A single-signer chain that executes transactions as soon as they are sent.
///
/// Contract creations store their init code as runtime code. Calls to an
/// address holding [`FACTORY_CODE`] behave like the singleton factory,
/// `diamondCut` and `facets()` act on the loupe state, and `newChain` creates a
/// chain proxy and a diamond and emits the registration events.
#[derive(Debug, Clone)]
pub struct MockChain {
    sender: Address,
    state: Arc<Mutex<State>>,
}

impl MockChain {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            state: Arc::default(),
        }
    }

    pub fn with_factory(self, factory: Address) -> Self {
        self.install_code(factory, Bytes::from_static(FACTORY_CODE));
        self
    }

    pub fn install_code(&self, address: Address, code: Bytes) {
        self.state.lock().unwrap().code.insert(address, code);
    }

    pub fn code_at(&self, address: Address) -> Bytes {
        self.state
            .lock()
            .unwrap()
            .code
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().nonce = nonce;
    }

    /// Fail the next submission using `nonce`, as a node does for a replaced nonce.
    pub fn reject_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().rejected_nonces.insert(nonce);
    }

    /// Revert factory deployments whose init code starts with `prefix`.
    pub fn revert_init_code(&self, prefix: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .reverting_init_code
            .push(prefix.into());
    }

    /// Revert calls of `selector` on `to` with `reason`.
    pub fn revert_call(&self, to: Address, selector: Selector, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .reverting_calls
            .insert((to, selector), reason.to_string());
    }

    /// Let factory calls succeed without leaving code behind.
    pub fn discard_factory_code(&self) {
        self.state.lock().unwrap().discard_factory_code = true;
    }

    pub fn clear_reverts(&self) {
        let mut state = self.state.lock().unwrap();
        state.reverting_init_code.clear();
        state.reverting_calls.clear();
    }

    pub fn set_facets(&self, diamond: Address, facets: Facets) {
        let mut state = self.state.lock().unwrap();
        state.code.insert(diamond, Bytes::from_static(&[0xd1]));
        state.facets.insert(diamond, facets);
    }

    pub fn facets_of(&self, diamond: Address) -> Facets {
        self.state
            .lock()
            .unwrap()
            .facets
            .get(&diamond)
            .cloned()
            .unwrap_or_default()
    }

    /// The facet holding `selector` on `diamond`.
    pub fn owner_of(&self, diamond: Address, selector: Selector) -> Option<Address> {
        self.facets_of(diamond)
            .into_iter()
            .find(|(_, selectors)| selectors.contains(&selector))
            .map(|(facet, _)| facet)
    }

    /// Every accepted transaction, in submission order.
    pub fn sent(&self) -> Vec<TxRequest> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl State {
    fn execute(&mut self, sender: Address, tx: &TxRequest, hash: B256) -> Receipt {
        let mut receipt = Receipt {
            tx_hash: hash,
            status: true,
            logs: Vec::new(),
            gas_used: 21_000,
            block_number: self.sent.len() as u64,
            contract_address: None,
        };

        let Some(to) = tx.to else {
            let address = sender.create(tx.nonce);
            self.code.insert(address, tx.data.clone());
            receipt.contract_address = Some(address);
            return receipt;
        };

        let called = tx.data.get(..4).map(Selector::from_slice);
        if let Some(selector) = called {
            if self.reverting_calls.contains_key(&(to, selector)) {
                receipt.status = false;
                return receipt;
            }
        }

        if self.code.get(&to).is_some_and(|code| code.as_ref() == FACTORY_CODE) {
            receipt.status = self.factory_deploy(to, &tx.data);
            return receipt;
        }

        match called {
            Some(selector) if selector == IDiamondCut::diamondCutCall::SELECTOR => {
                receipt.status = match IDiamondCut::diamondCutCall::abi_decode(&tx.data, true) {
                    Ok(call) => {
                        let facets = self.facets.entry(to).or_default();
                        apply_cut(facets, &call._diamondCut)
                    }
                    Err(_) => false,
                };
            }
            Some(selector) if selector == self::selector(NEW_CHAIN_SIGNATURE) => {
                match self.new_chain(to, &tx.data[4..]) {
                    Some(logs) => receipt.logs = logs,
                    None => receipt.status = false,
                }
            }
            _ => {}
        }
        receipt
    }

    fn factory_deploy(&mut self, factory: Address, data: &[u8]) -> bool {
        let Ok(call) = ISingletonFactory::deployCall::abi_decode(data, true) else {
            return false;
        };
        if self
            .reverting_init_code
            .iter()
            .any(|prefix| call._initCode.starts_with(prefix))
        {
            return false;
        }
        let address = factory.create2(call._salt, keccak256(&call._initCode));
        if self.code.contains_key(&address) {
            return false;
        }
        if !self.discard_factory_code {
            self.code.insert(address, call._initCode);
        }
        true
    }

    fn new_chain(&mut self, bridgehead: Address, args: &[u8]) -> Option<Vec<Log>> {
        let (chain_id, proof_system, _governor, _allow_list, cut) =
            <(U256, Address, Address, Address, IDiamondCut::DiamondCutData)>::abi_decode_params(
                args, true,
            )
            .ok()?;

        self.chains += 1;
        let chain_id = if chain_id.is_zero() {
            U256::from(269 + self.chains)
        } else {
            chain_id
        };
        let chain_proxy = bridgehead.create(1_000 + self.chains);
        let diamond = proof_system.create(2_000 + self.chains);
        self.code.insert(chain_proxy, Bytes::from_static(&[0xc1]));
        self.code.insert(diamond, Bytes::from_static(&[0xd1]));

        let mut facets = Facets::new();
        if !apply_cut(&mut facets, &cut.facetCuts) {
            return None;
        }
        self.facets.insert(diamond, facets);

        Some(vec![
            Log {
                address: bridgehead,
                topics: vec![
                    NewChain::SIGNATURE_HASH,
                    B256::from(chain_id),
                    chain_proxy.into_word(),
                ],
                data: Bytes::new(),
            },
            Log {
                address: proof_system,
                topics: vec![
                    NewProofChain::SIGNATURE_HASH,
                    B256::from(chain_id),
                    diamond.into_word(),
                ],
                data: Bytes::new(),
            },
        ])
    }
}

/// Apply a cut the way a diamond does, rejecting invalid entries.
fn apply_cut(facets: &mut Facets, cuts: &[IDiamondCut::FacetCut]) -> bool {
    fn owner(facets: &Facets, selector: &Selector) -> Option<usize> {
        facets.iter().position(|(_, selectors)| selectors.contains(selector))
    }
    fn take(facets: &mut Facets, index: usize, selector: &Selector) {
        facets[index].1.retain(|s| s != selector);
    }
    fn give(facets: &mut Facets, facet: Address, selector: Selector) {
        match facets.iter_mut().find(|(address, _)| *address == facet) {
            Some((_, selectors)) => selectors.push(selector),
            None => facets.push((facet, vec![selector])),
        }
    }

    for cut in cuts {
        for selector in &cut.functionSelectors {
            match cut.action {
                IDiamondCut::FacetCutAction::Add => {
                    if cut.facetAddress.is_zero() || owner(facets, selector).is_some() {
                        return false;
                    }
                    give(facets, cut.facetAddress, *selector);
                }
                IDiamondCut::FacetCutAction::Replace => match owner(facets, selector) {
                    Some(index) if facets[index].0 != cut.facetAddress => {
                        take(facets, index, selector);
                        give(facets, cut.facetAddress, *selector);
                    }
                    _ => return false,
                },
                IDiamondCut::FacetCutAction::Remove => match owner(facets, selector) {
                    Some(index) if cut.facetAddress.is_zero() => take(facets, index, selector),
                    _ => return false,
                },
                _ => return false,
            }
        }
        facets.retain(|(_, selectors)| !selectors.is_empty());
    }
    true
}

impl ChainClient for MockChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(if address == self.sender { state.nonce } else { 0 })
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        Ok(self.code_at(address))
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<PendingTx> {
        let mut state = self.state.lock().unwrap();
        if state.rejected_nonces.remove(&tx.nonce) {
            return Err(DeployError::rpc("eth_sendTransaction", "replacement transaction underpriced"));
        }
        let hash = keccak256((U256::from(tx.nonce), tx.data.clone(), state.sent.len() as u64).abi_encode());
        state.nonce = state.nonce.max(tx.nonce + 1);
        let receipt = state.execute(self.sender, &tx, hash);
        state.sent.push(tx.clone());
        state.receipts.insert(hash, receipt);
        Ok(PendingTx {
            hash,
            nonce: tx.nonce,
        })
    }

    async fn wait(&self, pending: &PendingTx) -> Result<Receipt> {
        self.state
            .lock()
            .unwrap()
            .receipts
            .get(&pending.hash)
            .cloned()
            .ok_or_else(|| DeployError::rpc("eth_getTransactionReceipt", "unknown transaction"))
    }

    async fn get_gas_price(&self) -> Result<u128> {
        Ok(GAS_PRICE)
    }

    async fn call(&self, call: CallRequest) -> Result<Bytes> {
        let state = self.state.lock().unwrap();
        let Some(selector) = call.data.get(..4).map(Selector::from_slice) else {
            return Ok(Bytes::new());
        };
        if let Some(reason) = state.reverting_calls.get(&(call.to, selector)) {
            return Err(DeployError::rpc("eth_call", format!("execution reverted: {reason}")));
        }
        if selector == IDiamondLoupe::facetsCall::SELECTOR {
            let facets: Vec<IDiamondLoupe::Facet> = state
                .facets
                .get(&call.to)
                .into_iter()
                .flatten()
                .map(|(addr, selectors)| IDiamondLoupe::Facet {
                    addr: *addr,
                    selectors: selectors.clone(),
                })
                .collect();
            return Ok(IDiamondLoupe::facetsCall::abi_encode_returns(&(facets,)).into());
        }
        Ok(Bytes::new())
    }
}

/// Selectors of each facet artifact.
pub fn facet_signatures(contract: &str) -> &'static [&'static str] {
    match contract {
        "DiamondCutFacet" => &["diamondCut((address,uint8,bytes4[])[],address,bytes)"],
        "GettersFacet" => &["getGovernor()", "getVerifier()", "facets()"],
        "ExecutorFacet" => &["commitBatches()", "proveBatches()", "executeBatches()"],
        "GovernanceFacet" => &["setPendingGovernor(address)", "acceptGovernor()"],
        _ => &[],
    }
}

/// Init code unique to `contract`.
pub fn init_code(contract: &str) -> Bytes {
    [&[0x60, 0x80][..], &keccak256(contract)[..8]].concat().into()
}

/// Every artifact the protocol plan, the factory bootstrap and upgrades use.
pub fn protocol_artifacts() -> StaticArtifactSource {
    const CONTRACTS: &[&str] = &[
        "AllowList",
        "Verifier",
        "DiamondInit",
        "ProofDefaultUpgrade",
        "Multicall3",
        "BridgeheadChain",
        "Bridgehead",
        "ProofSystem",
        "ProxyAdmin",
        "TransparentUpgradeableProxy",
        "L1ERC20Bridge",
        "L1WethBridge",
        "ValidatorTimelock",
        "DiamondUpgradeInit1",
        "WETH9",
    ];

    let source = CONTRACTS
        .iter()
        .fold(StaticArtifactSource::new(), |source, contract| {
            source.with_contract(*contract, init_code(contract), [])
        })
        .with_contract("SingletonFactory", Bytes::from_static(FACTORY_CODE), []);
    FACETS.iter().fold(source, |source, (_, contract)| {
        source.with_contract(
            *contract,
            init_code(contract),
            facet_signatures(contract).iter().map(|sig| selector(sig)),
        )
    })
}

pub fn protocol_parameters() -> BTreeMap<String, String> {
    [
        (keys::PRIORITY_TX_MAX_GAS_LIMIT, "72000000".to_string()),
        (keys::GENESIS_ROOT, B256::repeat_byte(1).to_string()),
        (keys::GENESIS_ROLLUP_LEAF_INDEX, "26".to_string()),
        (keys::GENESIS_BLOCK_COMMITMENT, B256::repeat_byte(2).to_string()),
        (keys::RECURSION_NODE_LEVEL_VK_HASH, B256::repeat_byte(3).to_string()),
        (keys::RECURSION_LEAF_LEVEL_VK_HASH, B256::repeat_byte(4).to_string()),
        (keys::RECURSION_CIRCUITS_SET_VKS_HASH, B256::ZERO.to_string()),
        (keys::BOOTLOADER_HASH, B256::repeat_byte(5).to_string()),
        (keys::DEFAULT_ACCOUNT_HASH, B256::repeat_byte(6).to_string()),
        (keys::L1_WETH_TOKEN, Address::repeat_byte(0x77).to_string()),
        (keys::VALIDATOR, Address::repeat_byte(0x78).to_string()),
        (keys::VALIDATOR_TIMELOCK_EXECUTION_DELAY, "0".to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

/// Settings for a full protocol deployment against [`MockChain`].
pub fn settings(dir: &Path) -> DeployerSettings {
    DeployerSettings {
        rpc_url: Url::parse("http://localhost:8545").unwrap(),
        deployer: SENDER,
        governor: None,
        create2_factory: None,
        salt: Some(SALT),
        registry_path: dir.join("deployed-addresses.json"),
        artifacts_dir: dir.to_path_buf(),
        deploy_multicall3: true,
        poll_interval_ms: 10,
        tx: TxOptions::default(),
        parameters: protocol_parameters(),
    }
}
