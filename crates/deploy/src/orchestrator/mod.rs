//! Group scheduling of deployment steps under a single signer.
//!
//! A run repeatedly takes every pending step whose dependencies are confirmed,
//! reserves one nonce per transaction the group needs, submits all of them
//! without waiting in between, then waits for every receipt before moving to
//! the next group.

mod nonce;
mod plan;

use std::{collections::BTreeSet, sync::Arc};

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};
use futures::future::join_all;

pub use nonce::NonceWindow;
pub use plan::{
    DeploymentPlan, DeploymentStep, EncodeFn, ExtractFn, SaltMode, StepAction, TargetFn,
};

use crate::{
    artifacts::ArtifactSource,
    chain::{ChainClient, PendingTx, Receipt, TxRequest, revert_reason},
    config::TxOptions,
    create2::{Create2Request, Create2Submission, DeterministicDeployer, Prepared, derive_salt},
    error::{DeployError, Result},
    registry::{AddressRecord, AddressRegistry, EnvBinding, RegistryStore},
};

/// Lifecycle of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepState {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// What happened to one step of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
    /// Set when the step needed a transaction.
    pub nonce: Option<u64>,
    pub tx_hash: Option<B256>,
}

/// Outcome of one confirmed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub index: usize,
    /// `None` when every step was already deployed.
    pub window: Option<NonceWindow>,
    pub steps: Vec<StepReport>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps whose outputs were recorded before the run started.
    pub skipped: Vec<String>,
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    pub fn transactions_sent(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|group| &group.steps)
            .filter(|step| step.nonce.is_some())
            .count()
    }
}

/// A step that needs a transaction.
enum Work {
    Create2(Create2Submission),
    Call {
        to: Address,
        data: Bytes,
        gas_limit: u64,
        extract: ExtractFn,
    },
}

enum Resolved {
    /// Code already at the predicted address.
    Deployed(AddressRecord),
    Work(Work),
}

struct Submission<'p> {
    index: usize,
    step: &'p DeploymentStep,
    work: Work,
    tx: TxRequest,
}

impl Submission<'_> {
    fn rejected(&self, reason: impl Into<String>) -> DeployError {
        let reason = reason.into();
        match self.work {
            Work::Create2(_) => DeployError::DeploymentFailed {
                name: self.step.name().to_string(),
                reason,
            },
            Work::Call { .. } => DeployError::TransactionRejected {
                step: self.step.name().to_string(),
                reason,
            },
        }
    }
}

/// Drives a [`DeploymentPlan`] to completion against a chain.
pub struct DeploymentOrchestrator<C> {
    client: C,
    artifacts: Arc<dyn ArtifactSource>,
    deployer: DeterministicDeployer,
    salt: B256,
    tx: TxOptions,
    store: Option<RegistryStore>,
    env_bindings: &'static [EnvBinding],
}

impl<C: ChainClient> DeploymentOrchestrator<C> {
    pub fn new(
        client: C,
        artifacts: Arc<dyn ArtifactSource>,
        factory: Address,
        salt: B256,
        tx: TxOptions,
    ) -> Self {
        Self {
            client,
            artifacts,
            deployer: DeterministicDeployer::new(factory, tx.gas_limit),
            salt,
            tx,
            store: None,
            env_bindings: &[],
        }
    }

    /// Persist the registry after every group.
    pub fn with_store(mut self, store: RegistryStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Log recorded addresses as `KEY=0x...` lines.
    pub fn with_env_bindings(mut self, bindings: &'static [EnvBinding]) -> Self {
        self.env_bindings = bindings;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn deployer(&self) -> &DeterministicDeployer {
        &self.deployer
    }

    /// Run every step not yet recorded in `registry`.
    ///
    /// The plan is validated before anything is sent. On failure, confirmed
    /// steps stay recorded (and persisted) so a rerun resumes after them.
    pub async fn run(&self, plan: &DeploymentPlan, registry: &mut AddressRegistry) -> Result<RunReport> {
        plan.validate()?;
        for step in plan.steps().iter().filter(|step| step.is_recorded(registry)) {
            self.check_recorded(step, registry)?;
        }

        let mut states: Vec<StepState> = plan
            .steps()
            .iter()
            .map(|step| {
                if step.is_recorded(registry) {
                    StepState::Confirmed
                } else {
                    StepState::Pending
                }
            })
            .collect();

        let mut report = RunReport {
            skipped: plan
                .steps()
                .iter()
                .zip(&states)
                .filter(|(_, state)| **state == StepState::Confirmed)
                .map(|(step, _)| step.name().to_string())
                .collect(),
            groups: Vec::new(),
        };
        for name in &report.skipped {
            tracing::debug!(step = %name, "Already recorded, skipping");
        }
        tracing::info!(
            steps = plan.len(),
            recorded = report.skipped.len(),
            "Starting deployment run"
        );

        loop {
            let confirmed: BTreeSet<&str> = plan
                .steps()
                .iter()
                .zip(&states)
                .filter(|(_, state)| **state == StepState::Confirmed)
                .map(|(step, _)| step.name())
                .collect();
            let ready: Vec<usize> = (0..plan.len())
                .filter(|&i| {
                    states[i] == StepState::Pending
                        && plan.steps()[i]
                            .dependencies()
                            .iter()
                            .all(|dependency| confirmed.contains(dependency.as_str()))
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let group = report.groups.len();
            let outcome = self
                .run_group(group, plan, &ready, &mut states, registry)
                .await;
            let saved = self.persist(registry);
            let group_report = outcome?;
            saved?;
            report.groups.push(group_report);
        }

        tracing::info!(
            groups = report.groups.len(),
            transactions = report.transactions_sent(),
            "Deployment run complete"
        );
        Ok(report)
    }

    async fn run_group<'p>(
        &self,
        group: usize,
        plan: &'p DeploymentPlan,
        ready: &[usize],
        states: &mut [StepState],
        registry: &mut AddressRegistry,
    ) -> Result<GroupReport> {
        let names: Vec<&str> = ready.iter().map(|&i| plan.steps()[i].name()).collect();
        tracing::info!(group, steps = ?names, "Starting group");

        let mut reports: Vec<StepReport> = ready
            .iter()
            .map(|&i| StepReport {
                name: plan.steps()[i].name().to_string(),
                state: StepState::Pending,
                nonce: None,
                tx_hash: None,
            })
            .collect();
        let report_of = |index: usize| ready.iter().position(|&i| i == index).unwrap_or(0);

        let mut failed: Vec<(String, DeployError)> = Vec::new();
        let mut confirmed: Vec<String> = Vec::new();

        // Resolve every step read-only before touching nonces.
        let resolved = {
            let snapshot: &AddressRegistry = registry;
            join_all(
                ready
                    .iter()
                    .map(|&i| self.resolve(&plan.steps()[i], snapshot)),
            )
            .await
        };

        let mut work = Vec::new();
        for (&index, resolved) in ready.iter().zip(resolved) {
            let step = &plan.steps()[index];
            match resolved {
                Ok(Resolved::Deployed(record)) => {
                    self.commit(registry, record)?;
                    states[index] = StepState::Confirmed;
                    reports[report_of(index)].state = StepState::Confirmed;
                    confirmed.push(step.name().to_string());
                }
                Ok(Resolved::Work(item)) => work.push((index, step, item)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    states[index] = StepState::Failed;
                    failed.push((step.name().to_string(), e));
                }
            }
        }
        if !failed.is_empty() {
            return Err(self.group_failure(group, plan, states, failed, confirmed));
        }
        if work.is_empty() {
            tracing::info!(group, "Group already deployed");
            return Ok(GroupReport {
                index: group,
                window: None,
                steps: reports,
            });
        }

        let mut window = NonceWindow::reserve(&self.client, work.len()).await?;
        let gas_price = match self.tx.gas_price {
            Some(price) => price,
            None => self.client.get_gas_price().await?,
        };

        let mut submissions = Vec::with_capacity(work.len());
        for (index, step, item) in work {
            let Some(nonce) = window.next_nonce() else {
                return Err(DeployError::config(format!(
                    "nonce window of group {group} exhausted at `{}`",
                    step.name()
                )));
            };
            let tx = match &item {
                Work::Create2(submission) => self.deployer.transaction(submission, nonce, gas_price),
                Work::Call {
                    to,
                    data,
                    gas_limit,
                    ..
                } => TxRequest {
                    to: Some(*to),
                    data: data.clone(),
                    value: U256::ZERO,
                    nonce,
                    gas_limit: *gas_limit,
                    gas_price,
                },
            };
            states[index] = StepState::Submitted;
            let report = &mut reports[report_of(index)];
            report.state = StepState::Submitted;
            report.nonce = Some(nonce);
            tracing::info!(step = %step.name(), nonce, "Submitting transaction");
            submissions.push(Submission {
                index,
                step,
                work: item,
                tx,
            });
        }

        let sent: Vec<Result<PendingTx>> = join_all(
            submissions
                .iter()
                .map(|submission| self.client.send_transaction(submission.tx.clone())),
        )
        .await;

        // Transactions after a rejected nonce cannot be mined until the gap is
        // filled, so they are not awaited.
        let gap = submissions
            .iter()
            .zip(&sent)
            .filter(|(_, result)| result.is_err())
            .map(|(submission, _)| submission.tx.nonce)
            .min();

        let mut awaiting: Vec<(&Submission<'p>, PendingTx)> = Vec::new();
        for (submission, result) in submissions.iter().zip(sent) {
            let index = submission.index;
            match result {
                Ok(pending) if gap.is_some_and(|nonce| pending.nonce > nonce) => {
                    tracing::warn!(
                        step = %submission.step.name(),
                        nonce = pending.nonce,
                        tx_hash = %pending.hash,
                        "Transaction stranded behind a rejected nonce"
                    );
                    reports[report_of(index)].tx_hash = Some(pending.hash);
                    states[index] = StepState::Failed;
                    failed.push((
                        submission.step.name().to_string(),
                        submission.rejected(format!(
                            "stranded behind rejected nonce {}; not awaited",
                            gap.unwrap_or_default()
                        )),
                    ));
                }
                Ok(pending) => {
                    reports[report_of(index)].tx_hash = Some(pending.hash);
                    awaiting.push((submission, pending));
                }
                Err(e) => {
                    states[index] = StepState::Failed;
                    failed.push((
                        submission.step.name().to_string(),
                        submission.rejected(e.to_string()),
                    ));
                }
            }
        }

        let receipts = join_all(awaiting.iter().map(|(_, pending)| self.client.wait(pending))).await;
        let finalized = {
            let snapshot: &AddressRegistry = registry;
            join_all(
                awaiting
                    .iter()
                    .zip(receipts)
                    .map(|((submission, _), receipt)| self.finalize(submission, receipt, snapshot)),
            )
            .await
        };

        let mut fatal = None;
        for ((submission, _), result) in awaiting.iter().zip(finalized) {
            let index = submission.index;
            let name = submission.step.name().to_string();
            let committed = result.and_then(|records| {
                records
                    .into_iter()
                    .try_for_each(|record| self.commit(registry, record))
            });
            match committed {
                Ok(()) => {
                    states[index] = StepState::Confirmed;
                    confirmed.push(name);
                }
                Err(e) => {
                    tracing::warn!(step = %name, error = %e, "Step failed");
                    states[index] = StepState::Failed;
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    } else {
                        failed.push((name, e));
                    }
                }
            }
        }
        for (report, &index) in reports.iter_mut().zip(ready) {
            report.state = states[index];
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if !failed.is_empty() {
            return Err(self.group_failure(group, plan, states, failed, confirmed));
        }

        tracing::info!(group, transactions = window.len(), "Group confirmed");
        Ok(GroupReport {
            index: group,
            window: Some(window),
            steps: reports,
        })
    }

    fn step_salt(&self, step: &DeploymentStep, mode: SaltMode) -> B256 {
        match mode {
            SaltMode::Shared => self.salt,
            SaltMode::Derived => derive_salt(self.salt, step.name()),
        }
    }

    /// Fail a recorded CREATE2 step whose salt now yields different init code.
    ///
    /// Only records carrying a CREATE2 fingerprint are checked; the chain is
    /// not queried.
    fn check_recorded(&self, step: &DeploymentStep, registry: &AddressRegistry) -> Result<()> {
        let StepAction::Create2 {
            contract,
            constructor_args,
            salt,
            ..
        } = step.action()
        else {
            return Ok(());
        };
        if registry
            .record(step.name())
            .and_then(|record| record.salt)
            .is_none()
        {
            return Ok(());
        }

        let init_code = [
            self.artifacts.init_code(contract)?.as_ref(),
            constructor_args(registry)?.as_ref(),
        ]
        .concat();
        registry.check_salt(step.name(), self.step_salt(step, *salt), keccak256(init_code))
    }

    /// Everything a step needs before a nonce is assigned. Sends nothing.
    async fn resolve(&self, step: &DeploymentStep, registry: &AddressRegistry) -> Result<Resolved> {
        match step.action() {
            StepAction::Create2 {
                contract,
                kind,
                constructor_args,
                salt,
            } => {
                let salt = self.step_salt(step, *salt);
                let request = Create2Request {
                    name: step.name().to_string(),
                    kind: *kind,
                    bytecode: self.artifacts.init_code(contract)?,
                    constructor_args: constructor_args(registry)?,
                    salt,
                    gas_limit: step.requested_gas_limit(),
                };
                Ok(match self.deployer.prepare(&self.client, registry, &request).await? {
                    Prepared::AlreadyDeployed(record) => Resolved::Deployed(record),
                    Prepared::Submit(submission) => Resolved::Work(Work::Create2(submission)),
                })
            }
            StepAction::Call {
                target,
                calldata,
                extract,
            } => Ok(Resolved::Work(Work::Call {
                to: target(registry)?,
                data: calldata(registry)?,
                gas_limit: self.tx.effective_gas_limit(step.requested_gas_limit()),
                extract: extract.clone(),
            })),
        }
    }

    /// Check a mined transaction and return the records it produced.
    async fn finalize(
        &self,
        submission: &Submission<'_>,
        receipt: Result<Receipt>,
        registry: &AddressRegistry,
    ) -> Result<Vec<AddressRecord>> {
        let receipt = receipt?;
        match &submission.work {
            Work::Create2(create2) => Ok(vec![
                self.deployer
                    .finalize(&self.client, create2, &submission.tx, &receipt)
                    .await?,
            ]),
            Work::Call { extract, .. } => {
                let step = submission.step.name();
                if !receipt.status {
                    return Err(submission.rejected(revert_reason(&self.client, &submission.tx).await));
                }
                let records = extract(registry, &receipt)?;
                if let Some(missing) = submission
                    .step
                    .outputs()
                    .iter()
                    .find(|output| !records.iter().any(|record| &record.name == *output))
                {
                    return Err(submission.rejected(format!("receipt did not yield `{missing}`")));
                }
                tracing::info!(step = %step, gas_used = receipt.gas_used, "Call confirmed");
                Ok(records)
            }
        }
    }

    fn commit(&self, registry: &mut AddressRegistry, record: AddressRecord) -> Result<()> {
        let name = record.name.clone();
        let address = record.address;
        if registry.insert(record)? {
            match self.env_bindings.iter().find(|binding| binding.name == name) {
                Some(binding) => tracing::info!("{}={}", binding.env_key, address),
                None => tracing::info!(name = %name, %address, "Recorded"),
            }
        }
        Ok(())
    }

    fn persist(&self, registry: &AddressRegistry) -> Result<()> {
        match &self.store {
            Some(store) => store.save(registry),
            None => Ok(()),
        }
    }

    fn group_failure(
        &self,
        group: usize,
        plan: &DeploymentPlan,
        states: &[StepState],
        failed: Vec<(String, DeployError)>,
        confirmed: Vec<String>,
    ) -> DeployError {
        let not_started: Vec<String> = plan
            .steps()
            .iter()
            .zip(states)
            .filter(|(_, state)| **state == StepState::Pending)
            .map(|(step, _)| step.name().to_string())
            .collect();
        tracing::warn!(
            group,
            failed = failed.len(),
            confirmed = confirmed.len(),
            not_started = not_started.len(),
            "Group failed, rerun to resume"
        );
        DeployError::PartialGroupFailure {
            group,
            failed,
            confirmed,
            not_started,
        }
    }
}
