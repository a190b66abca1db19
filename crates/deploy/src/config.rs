//! Deployment settings and named parameters.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_core::primitives::{Address, B256, U256};
use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{DeployError, Result};

/// The default name for the settings file.
pub const SETTINGS_FILENAME: &str = "Bridgehead.toml";

/// Prefix of environment variables that override settings.
pub const ENV_PREFIX: &str = "BRIDGEHEAD_";

/// Gas limit floor applied to every deployment transaction.
pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

/// Default interval between receipt polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Source of named parameters resolved from the deploying environment.
///
/// Absence of a required parameter is a configuration error, never a runtime fault.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| DeployError::MissingParameter {
                key: key.to_string(),
            })
    }

    fn address(&self, key: &str) -> Result<Address> {
        let value = self.require(key)?;
        Address::from_str(value.trim()).map_err(|e| invalid(key, e))
    }

    fn b256(&self, key: &str) -> Result<B256> {
        let value = self.require(key)?;
        B256::from_str(value.trim()).map_err(|e| invalid(key, e))
    }

    fn u64(&self, key: &str) -> Result<u64> {
        let value = self.require(key)?;
        let value = value.trim();
        match value.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => value.parse(),
        }
        .map_err(|e| invalid(key, e))
    }

    fn u256(&self, key: &str) -> Result<U256> {
        let value = self.require(key)?;
        U256::from_str(value.trim()).map_err(|e| invalid(key, e))
    }
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> DeployError {
    DeployError::InvalidParameter {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// In-memory parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapConfig(BTreeMap<String, String>);

impl MapConfig {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Settings parameters first, then the process environment.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    parameters: MapConfig,
}

impl LayeredConfig {
    pub fn new(parameters: MapConfig) -> Self {
        Self { parameters }
    }
}

impl ConfigSource for LayeredConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.parameters
            .get(key)
            .or_else(|| std::env::var(key).ok())
    }
}

/// Transaction options applied to submitted transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    /// Gas price in wei. Queried from the node once per group when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    /// Floor for the gas limit of every transaction.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Explicit nonce for single-shot operations. Group runs always re-derive
    /// nonces from the live transaction count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            gas_price: None,
            gas_limit: DEFAULT_GAS_LIMIT,
            nonce: None,
        }
    }
}

impl TxOptions {
    /// The gas limit to use given a per-transaction request.
    pub fn effective_gas_limit(&self, requested: Option<u64>) -> u64 {
        requested.map_or(self.gas_limit, |gas| gas.max(self.gas_limit))
    }
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("deployed-addresses.json")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

/// Everything needed to run a deployment.
///
/// Loaded from a TOML file merged with `BRIDGEHEAD_`-prefixed environment
/// variables (nested keys use `__`, e.g. `BRIDGEHEAD_TX__GAS_LIMIT`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployerSettings {
    /// HTTP JSON-RPC endpoint of the target network.
    pub rpc_url: Url,
    /// Account that signs and pays for every transaction.
    pub deployer: Address,
    /// Governor of the deployed contracts. Defaults to the deployer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governor: Option<Address>,
    /// CREATE2 factory. Deployed and recorded first when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create2_factory: Option<Address>,
    /// Salt for every CREATE2 deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<B256>,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub deploy_multicall3: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub tx: TxOptions,
    /// Named parameters (`CONTRACTS_*` keys), consulted before the environment.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl DeployerSettings {
    /// The settings file for `path`: the file itself, `Bridgehead.toml` inside a
    /// directory, or `./Bridgehead.toml` when no path is given.
    pub fn settings_file(path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) if path.is_dir() => path.join(SETTINGS_FILENAME),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(SETTINGS_FILENAME),
        }
    }

    /// Load settings from the TOML file at [`Self::settings_file`] and the environment.
    ///
    /// An explicit path must exist. Without one, `./Bridgehead.toml` is merged
    /// when present, so a salt saved there by an earlier run is reused.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_file(&Self::settings_file(path), path.is_some())
    }

    fn load_file(file: &Path, required: bool) -> anyhow::Result<Self> {
        let mut figment = Figment::new();
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        } else if required {
            anyhow::bail!("Settings file not found: {}", file.display());
        }
        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load deployer settings")?;

        tracing::info!(
            rpc_url = %settings.rpc_url,
            deployer = %settings.deployer,
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Save the settings to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Settings saved");
        Ok(())
    }

    pub fn governor(&self) -> Address {
        self.governor.unwrap_or(self.deployer)
    }

    /// The configured salt, or a freshly generated one stored back into the settings.
    ///
    /// A generated salt must be persisted by the caller, otherwise a rerun
    /// would target different addresses.
    pub fn salt_or_generate(&mut self) -> B256 {
        if let Some(salt) = self.salt {
            return salt;
        }
        let salt = B256::from(rand::rng().random::<[u8; 32]>());
        tracing::warn!(salt = %salt, "No CREATE2 salt configured, generated a random one");
        self.salt = Some(salt);
        salt
    }

    /// Named parameters layered over the process environment.
    pub fn parameters(&self) -> LayeredConfig {
        LayeredConfig::new(MapConfig::new(self.parameters.clone()))
    }

    pub fn fingerprint(&self) -> DeploymentFingerprint {
        DeploymentFingerprint {
            deployer: self.deployer,
            governor: self.governor(),
            create2_factory: self.create2_factory,
            salt: self.salt,
        }
    }
}

/// The settings that, when changed, move deterministic addresses.
///
/// Gas, polling and path settings are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFingerprint {
    pub deployer: Address,
    pub governor: Address,
    pub create2_factory: Option<Address>,
    pub salt: Option<B256>,
}

impl DeploymentFingerprint {
    /// SHA-256 of the JSON encoding, hex encoded.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(json))
    }
}
