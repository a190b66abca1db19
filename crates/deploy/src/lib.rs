//! bridgehead-deploy - Deployment library for the Bridgehead protocol stack.
//!
//! This crate deploys the hub, proof system diamond and asset bridges at
//! deterministic CREATE2 addresses, scheduling independent transactions of a
//! single signer in nonce-ordered groups, and upgrades the diamond's facets.

pub mod artifacts;
pub mod chain;
pub mod config;
pub mod create2;
pub mod diamond;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod upgrade;

mod deployer;
pub use deployer::Deployer;

pub use artifacts::{ArtifactSource, FsArtifactSource, StaticArtifactSource};
pub use chain::{CallRequest, ChainClient, JsonRpcChainClient, Log, PendingTx, Receipt, TxRequest};
pub use config::{
    ConfigSource, DeployerSettings, LayeredConfig, MapConfig, SETTINGS_FILENAME, TxOptions,
};
pub use create2::{Create2Request, DeterministicDeployer, derive_salt, predict_address};
pub use diamond::{DiamondState, FacetAction, FacetCut, TargetFacet, compute_cut};
pub use error::{DeployError, Result};
pub use orchestrator::{
    DeploymentOrchestrator, DeploymentPlan, DeploymentStep, NonceWindow, RunReport, StepState,
};
pub use protocol::{ENV_BINDINGS, ProtocolParams, UpgradeOptions, UpgradeOutcome};
pub use registry::{AddressRecord, AddressRegistry, ContractKind, EnvBinding, RegistryStore};
pub use upgrade::UpgradeRegistrar;
