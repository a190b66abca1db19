//! Contract artifacts: init code, ABI and function selectors by contract name.

use std::{
    collections::{BTreeSet, HashMap},
    ffi::OsStr,
    path::{Path, PathBuf},
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Bytes, Selector},
};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::{DeployError, Result};

/// Where contract bytecode and interfaces come from.
pub trait ArtifactSource: Send + Sync {
    /// Creation bytecode, without constructor arguments.
    fn init_code(&self, contract: &str) -> Result<Bytes>;

    /// Selectors of every external function of the contract.
    fn selectors(&self, contract: &str) -> Result<BTreeSet<Selector>> {
        Ok(self
            .abi(contract)?
            .functions()
            .map(|function| function.selector())
            .collect())
    }

    fn abi(&self, contract: &str) -> Result<JsonAbi>;
}

fn artifact_error(contract: &str, reason: impl std::fmt::Display) -> DeployError {
    DeployError::Artifact {
        contract: contract.to_string(),
        reason: reason.to_string(),
    }
}

/// Bytecode as found in Hardhat (`"0x..."`) and Foundry (`{"object": "0x..."}`) artifacts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

impl RawBytecode {
    fn as_hex(&self) -> &str {
        match self {
            RawBytecode::Hex(hex) => hex,
            RawBytecode::Object { object } => object,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    abi: JsonAbi,
    bytecode: RawBytecode,
}

/// Reads `<Name>.json` artifacts from a build output directory.
///
/// The file is looked up directly under the root first, then anywhere below it
/// (`artifacts/contracts/Foo.sol/Foo.json`, `out/Foo.sol/Foo.json`).
#[derive(Debug, Clone)]
pub struct FsArtifactSource {
    root: PathBuf,
}

impl FsArtifactSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, contract: &str) -> Result<PathBuf> {
        let file_name = format!("{contract}.json");
        let direct = self.root.join(&file_name);
        if direct.is_file() {
            return Ok(direct);
        }
        find_file(&self.root, &file_name)
            .map_err(|e| artifact_error(contract, format!("failed to search {}: {e}", self.root.display())))?
            .ok_or_else(|| {
                artifact_error(
                    contract,
                    format!("no artifact found under {}", self.root.display()),
                )
            })
    }

    fn load(&self, contract: &str) -> Result<RawArtifact> {
        let path = self.locate(contract)?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| artifact_error(contract, format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| artifact_error(contract, format!("failed to parse {}: {e}", path.display())))
    }
}

/// Depth-first search in file name order.
fn find_file(root: &Path, file_name: &str) -> walkdir::Result<Option<PathBuf>> {
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.path().is_file() && entry.file_name() == OsStr::new(file_name) {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

impl ArtifactSource for FsArtifactSource {
    fn init_code(&self, contract: &str) -> Result<Bytes> {
        let artifact = self.load(contract)?;
        let hex = artifact.bytecode.as_hex();
        let code: Bytes = hex
            .parse()
            .map_err(|e| artifact_error(contract, format!("invalid bytecode (unlinked library?): {e}")))?;
        if code.is_empty() {
            return Err(artifact_error(contract, "empty bytecode (abstract contract or interface?)"));
        }
        Ok(code)
    }

    fn abi(&self, contract: &str) -> Result<JsonAbi> {
        Ok(self.load(contract)?.abi)
    }
}

#[derive(Debug, Clone, Default)]
struct StaticArtifact {
    init_code: Bytes,
    selectors: BTreeSet<Selector>,
    abi: JsonAbi,
}

/// In-memory artifacts, for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticArtifactSource {
    contracts: HashMap<String, StaticArtifact>,
}

impl StaticArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract with explicit selectors.
    pub fn with_contract(
        mut self,
        name: impl Into<String>,
        init_code: impl Into<Bytes>,
        selectors: impl IntoIterator<Item = Selector>,
    ) -> Self {
        self.contracts.insert(
            name.into(),
            StaticArtifact {
                init_code: init_code.into(),
                selectors: selectors.into_iter().collect(),
                abi: JsonAbi::default(),
            },
        );
        self
    }

    fn get(&self, contract: &str) -> Result<&StaticArtifact> {
        self.contracts
            .get(contract)
            .ok_or_else(|| artifact_error(contract, "unknown contract"))
    }
}

impl ArtifactSource for StaticArtifactSource {
    fn init_code(&self, contract: &str) -> Result<Bytes> {
        Ok(self.get(contract)?.init_code.clone())
    }

    fn selectors(&self, contract: &str) -> Result<BTreeSet<Selector>> {
        Ok(self.get(contract)?.selectors.clone())
    }

    fn abi(&self, contract: &str) -> Result<JsonAbi> {
        Ok(self.get(contract)?.abi.clone())
    }
}
