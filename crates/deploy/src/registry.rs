//! Address registry: logical contract names to on-chain addresses.
//!
//! The registry is only ever extended. Re-recording a name with the address it
//! already has is a no-op, recording it with a different address aborts the run,
//! since it means a deterministic deployment produced a different result.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256};
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    config::ConfigSource,
    error::{DeployError, Result},
};

/// Current version of the on-disk snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// What kind of contract a record points at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ContractKind {
    Implementation,
    Proxy,
    ProxyAdmin,
    /// Marker for a confirmed registration call; the address is the registered contract.
    Registration,
}

/// A single registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub name: String,
    pub address: Address,
    pub kind: ContractKind,
    /// Salt used for a CREATE2 deployment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<B256>,
    /// Hash of the full init code (bytecode plus constructor arguments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_code_hash: Option<B256>,
}

impl AddressRecord {
    pub fn new(name: impl Into<String>, address: Address, kind: ContractKind) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
            salt: None,
            init_code_hash: None,
        }
    }

    /// Attach the CREATE2 inputs the address was derived from.
    pub fn with_create2(mut self, salt: B256, init_code_hash: B256) -> Self {
        self.salt = Some(salt);
        self.init_code_hash = Some(init_code_hash);
        self
    }
}

/// Maps a record name to the environment key downstream tooling reads it from.
#[derive(Debug, Clone, Copy)]
pub struct EnvBinding {
    pub name: &'static str,
    pub env_key: &'static str,
    pub kind: ContractKind,
}

/// Namespaced name -> address store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRegistry {
    records: BTreeMap<String, AddressRecord>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(records: BTreeMap<String, AddressRecord>) -> Self {
        Self { records }
    }

    pub fn get(&self, name: &str) -> Result<Address> {
        self.records
            .get(name)
            .map(|record| record.address)
            .ok_or_else(|| DeployError::NotFound(name.to_string()))
    }

    pub fn record(&self, name: &str) -> Option<&AddressRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRecord> {
        self.records.values()
    }

    /// Record `name -> address` as an implementation contract.
    pub fn set(&mut self, name: &str, address: Address) -> Result<()> {
        self.insert(AddressRecord::new(name, address, ContractKind::Implementation))
            .map(|_| ())
    }

    /// Insert a record, returning whether the registry changed.
    ///
    /// Fails with [`DeployError::RegistryConflict`] if the name is already bound
    /// to a different address.
    pub fn insert(&mut self, record: AddressRecord) -> Result<bool> {
        match self.records.get_mut(&record.name) {
            Some(existing) if existing.address != record.address => {
                Err(DeployError::RegistryConflict {
                    name: record.name,
                    recorded: existing.address,
                    attempted: record.address,
                })
            }
            Some(existing) => {
                // Same address: only fill in a missing fingerprint.
                let mut changed = false;
                if existing.salt.is_none() && record.salt.is_some() {
                    existing.salt = record.salt;
                    existing.init_code_hash = record.init_code_hash;
                    changed = true;
                }
                Ok(changed)
            }
            None => {
                tracing::debug!(name = %record.name, address = %record.address, kind = %record.kind, "Recording address");
                self.records.insert(record.name.clone(), record);
                Ok(true)
            }
        }
    }

    /// Reject reuse of a recorded salt with different init code for the same name.
    pub fn check_salt(&self, name: &str, salt: B256, init_code_hash: B256) -> Result<()> {
        let Some(record) = self.records.get(name) else {
            return Ok(());
        };
        match (record.salt, record.init_code_hash) {
            (Some(recorded_salt), Some(recorded)) if recorded_salt == salt && recorded != init_code_hash => {
                Err(DeployError::SaltReuse {
                    name: name.to_string(),
                    salt,
                    recorded,
                    requested: init_code_hash,
                })
            }
            _ => Ok(()),
        }
    }

    /// A serializable copy of all records.
    pub fn snapshot(&self) -> BTreeMap<String, AddressRecord> {
        self.records.clone()
    }

    /// Seed records from environment-style parameters. Absent keys are skipped.
    pub fn import_env(
        &mut self,
        source: &dyn ConfigSource,
        bindings: &[EnvBinding],
    ) -> Result<usize> {
        let mut imported = 0;
        for binding in bindings {
            if source.get(binding.env_key).is_none() {
                continue;
            }
            let address = source.address(binding.env_key)?;
            if self.insert(AddressRecord::new(binding.name, address, binding.kind))? {
                imported += 1;
            }
        }
        Ok(imported)
    }

    /// Render recorded addresses as `KEY=0x...` lines, in binding order.
    pub fn env_lines(&self, bindings: &[EnvBinding]) -> Vec<String> {
        bindings
            .iter()
            .filter_map(|binding| {
                self.records
                    .get(binding.name)
                    .map(|record| format!("{}={}", binding.env_key, record.address))
            })
            .collect()
    }
}

/// On-disk snapshot format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_hash: Option<String>,
    records: BTreeMap<String, AddressRecord>,
}

/// JSON-file persistence for an [`AddressRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    config_hash: Option<String>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config_hash: None,
        }
    }

    /// Tag saved snapshots with a fingerprint of the deployment settings.
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, or an empty one if no snapshot exists yet.
    pub fn load(&self) -> Result<AddressRegistry> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No registry snapshot found, starting empty");
            return Ok(AddressRegistry::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read registry from {}", self.path.display()))?;
        let snapshot: SnapshotFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry {}", self.path.display()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported registry snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )
            .into());
        }

        if let (Some(saved), Some(current)) = (&snapshot.config_hash, &self.config_hash) {
            if saved != current {
                tracing::warn!(
                    saved = %saved,
                    current = %current,
                    "Deployment settings changed since the registry was written"
                );
            }
        }

        tracing::info!(
            path = %self.path.display(),
            records = snapshot.records.len(),
            updated_at = %snapshot.updated_at,
            "Registry loaded"
        );
        Ok(AddressRegistry::from_snapshot(snapshot.records))
    }

    /// Atomically write the registry to disk.
    pub fn save(&self, registry: &AddressRegistry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let lock = self.lock()?;

        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            config_hash: self.config_hash.clone(),
            records: registry.snapshot(),
        };
        let json =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize registry")?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move registry into {}", self.path.display()))?;

        lock.unlock().context("Failed to release registry lock")?;
        tracing::debug!(path = %self.path.display(), records = registry.len(), "Registry saved");
        Ok(())
    }

    /// Write `KEY=0x...` lines for the given bindings.
    pub fn export_env(
        &self,
        registry: &AddressRegistry,
        bindings: &[EnvBinding],
        path: &Path,
    ) -> Result<()> {
        let mut content = registry.env_lines(bindings).join("\n");
        content.push('\n');
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write env file {}", path.display()))?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<File> {
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use alloy_core::primitives::address;
    use tempdir::TempDir;

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    #[test]
    fn test_set_is_idempotent() {
        let mut registry = AddressRegistry::new();
        registry.set("AllowList", A).unwrap();
        registry.set("AllowList", A).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("AllowList").unwrap(), A);
    }

    #[test]
    fn test_set_different_address_is_rejected() {
        let mut registry = AddressRegistry::new();
        registry.set("AllowList", A).unwrap();
        let err = registry.set("AllowList", B).unwrap_err();
        assert!(matches!(
            err,
            DeployError::RegistryConflict { recorded, attempted, .. } if recorded == A && attempted == B
        ));
        assert_eq!(registry.get("AllowList").unwrap(), A);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let registry = AddressRegistry::new();
        assert!(matches!(
            registry.get("Bridgehead.BridgeheadProxy"),
            Err(DeployError::NotFound(_))
        ));
    }

    #[test]
    fn test_check_salt_detects_changed_init_code() {
        let mut registry = AddressRegistry::new();
        let salt = B256::repeat_byte(1);
        registry
            .insert(
                AddressRecord::new("AllowList", A, ContractKind::Implementation)
                    .with_create2(salt, B256::repeat_byte(2)),
            )
            .unwrap();

        assert!(registry.check_salt("AllowList", salt, B256::repeat_byte(2)).is_ok());
        assert!(matches!(
            registry.check_salt("AllowList", salt, B256::repeat_byte(3)),
            Err(DeployError::SaltReuse { .. })
        ));
        // A new salt is a deliberate redeploy, not a reuse.
        assert!(registry
            .check_salt("AllowList", B256::repeat_byte(9), B256::repeat_byte(3))
            .is_ok());
    }

    #[test]
    fn test_store_round_trip_and_missing_file() {
        let temp_dir = TempDir::new("bridgehead-test").expect("Failed to create temp dir");
        let store = RegistryStore::new(temp_dir.path().join("addresses.json"));

        assert!(store.load().unwrap().is_empty());

        let mut registry = AddressRegistry::new();
        registry
            .insert(AddressRecord::new("Bridges.ERC20BridgeProxy", B, ContractKind::Proxy))
            .unwrap();
        registry.set("AllowList", A).unwrap();
        store.save(&registry).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(
            loaded.record("Bridges.ERC20BridgeProxy").unwrap().kind,
            ContractKind::Proxy
        );
    }

    #[test]
    fn test_store_rejects_corrupted_file() {
        let temp_dir = TempDir::new("bridgehead-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("addresses.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let result = RegistryStore::new(path).load();
        assert!(matches!(result, Err(DeployError::Persistence(_))));
    }

    #[test]
    fn test_import_env_and_env_lines() {
        const BINDINGS: &[EnvBinding] = &[
            EnvBinding {
                name: "AllowList",
                env_key: "CONTRACTS_L1_ALLOW_LIST_ADDR",
                kind: ContractKind::Implementation,
            },
            EnvBinding {
                name: "ValidatorTimelock",
                env_key: "CONTRACTS_VALIDATOR_TIMELOCK_ADDR",
                kind: ContractKind::Implementation,
            },
        ];
        let config = MapConfig::from_pairs([("CONTRACTS_L1_ALLOW_LIST_ADDR", A.to_string())]);

        let mut registry = AddressRegistry::new();
        assert_eq!(registry.import_env(&config, BINDINGS).unwrap(), 1);
        assert_eq!(registry.get("AllowList").unwrap(), A);
        assert!(!registry.contains("ValidatorTimelock"));

        assert_eq!(
            registry.env_lines(BINDINGS),
            vec![format!("CONTRACTS_L1_ALLOW_LIST_ADDR={A}")]
        );
    }
}
