use std::{sync::Arc, time::Duration};

use alloy_core::primitives::{Address, B256};
use anyhow::Context;

use crate::{
    artifacts::{ArtifactSource, FsArtifactSource},
    chain::{ChainClient, JsonRpcChainClient},
    config::DeployerSettings,
    create2::DeterministicDeployer,
    error::{DeployError, Result},
    orchestrator::{DeploymentOrchestrator, DeploymentPlan, RunReport},
    protocol::{self, ENV_BINDINGS, ProtocolParams, UpgradeOptions, UpgradeOutcome},
    registry::{AddressRegistry, RegistryStore},
};

/// Deploys and upgrades the protocol stack described by a [`DeployerSettings`].
///
/// Every operation starts from the persisted registry, seeded with any
/// `CONTRACTS_*_ADDR` parameters, so reruns resume where the last run stopped.
pub struct Deployer<C> {
    settings: DeployerSettings,
    client: C,
    artifacts: Arc<dyn ArtifactSource>,
    salt: B256,
}

impl Deployer<JsonRpcChainClient> {
    /// Connect to the settings' RPC endpoint and read artifacts from disk.
    pub fn connect(settings: DeployerSettings) -> anyhow::Result<Self> {
        let client = JsonRpcChainClient::new(
            settings.rpc_url.clone(),
            settings.deployer,
            Duration::from_millis(settings.poll_interval_ms),
        )
        .context("Failed to create RPC client")?;
        let artifacts = Arc::new(FsArtifactSource::new(&settings.artifacts_dir));
        Ok(Self::new(settings, client, artifacts)?)
    }
}

impl<C: ChainClient> Deployer<C> {
    /// The settings must carry a salt; see [`DeployerSettings::salt_or_generate`].
    pub fn new(settings: DeployerSettings, client: C, artifacts: Arc<dyn ArtifactSource>) -> Result<Self> {
        let salt = settings
            .salt
            .ok_or_else(|| DeployError::config("no CREATE2 salt configured"))?;
        Ok(Self {
            settings,
            client,
            artifacts,
            salt,
        })
    }

    pub fn settings(&self) -> &DeployerSettings {
        &self.settings
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> RegistryStore {
        RegistryStore::new(&self.settings.registry_path)
            .with_config_hash(self.settings.fingerprint().compute_hash())
    }

    /// The persisted registry, seeded from `CONTRACTS_*_ADDR` parameters.
    pub fn load_registry(&self) -> Result<AddressRegistry> {
        let mut registry = self.store().load()?;
        let imported = registry.import_env(&self.settings.parameters(), ENV_BINDINGS)?;
        if imported > 0 {
            tracing::info!(imported, "Seeded registry from parameters");
        }
        Ok(registry)
    }

    pub fn params(&self) -> Result<ProtocolParams> {
        ProtocolParams::from_config(
            &self.settings.parameters(),
            self.settings.governor(),
            self.settings.deploy_multicall3,
        )
    }

    /// The step graph, checked for cycles and selector conflicts. Sends nothing.
    pub fn plan(&self) -> Result<DeploymentPlan> {
        protocol::protocol_plan(&self.params()?, self.artifacts.as_ref())
    }

    async fn factory(&self, registry: &mut AddressRegistry) -> Result<Address> {
        let factory = protocol::ensure_create2_factory(
            &self.client,
            self.settings.create2_factory,
            registry,
            self.artifacts.as_ref(),
            &self.settings.tx,
        )
        .await;
        self.store().save(registry)?;
        factory
    }

    /// Deploy every step of the protocol plan not yet recorded.
    pub async fn deploy(&self) -> Result<(RunReport, AddressRegistry)> {
        let plan = self.plan()?;
        let mut registry = self.load_registry()?;
        let factory = self.factory(&mut registry).await?;
        tracing::info!(%factory, salt = %self.salt, "Deploying protocol");

        let orchestrator = DeploymentOrchestrator::new(
            &self.client,
            self.artifacts.clone(),
            factory,
            self.salt,
            self.settings.tx.clone(),
        )
        .with_store(self.store())
        .with_env_bindings(ENV_BINDINGS);
        let report = orchestrator.run(&plan, &mut registry).await?;
        Ok((report, registry))
    }

    /// Bring the diamond's facets to the recorded ones.
    ///
    /// A dry run never deploys a factory: predicting the initializer address
    /// needs one configured or recorded.
    pub async fn upgrade(&self, options: &UpgradeOptions) -> Result<UpgradeOutcome> {
        let mut registry = self.load_registry()?;
        let known_factory = self.settings.create2_factory.or_else(|| {
            registry
                .record(protocol::names::CREATE2_FACTORY)
                .map(|record| record.address)
        });
        let factory = match (options.init_version, options.dry_run) {
            (None, _) => known_factory.unwrap_or_default(),
            (Some(_), true) => known_factory.ok_or_else(|| {
                DeployError::config("dry run with an initializer needs a configured or recorded Create2 factory")
            })?,
            (Some(_), false) => self.factory(&mut registry).await?,
        };
        let deployer = DeterministicDeployer::new(factory, self.settings.tx.gas_limit);
        let outcome = protocol::upgrade_diamond(
            &self.client,
            &mut registry,
            self.artifacts.as_ref(),
            &deployer,
            self.salt,
            &self.settings.tx,
            options,
        )
        .await;
        if !options.dry_run {
            self.store().save(&registry)?;
        }
        outcome
    }
}
