//! Deployment steps and their dependency graph.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use alloy_core::primitives::{Address, Bytes};

use crate::{
    chain::Receipt,
    error::{DeployError, Result},
    registry::{AddressRecord, AddressRegistry, ContractKind},
};

/// Computes bytes (constructor arguments, calldata) from already recorded addresses.
pub type EncodeFn = Arc<dyn Fn(&AddressRegistry) -> Result<Bytes> + Send + Sync>;

/// Resolves a call target from already recorded addresses.
pub type TargetFn = Arc<dyn Fn(&AddressRegistry) -> Result<Address> + Send + Sync>;

/// Extracts the records a confirmed call produced.
pub type ExtractFn = Arc<dyn Fn(&AddressRegistry, &Receipt) -> Result<Vec<AddressRecord>> + Send + Sync>;

/// Which salt a CREATE2 step uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaltMode {
    /// The run's salt.
    #[default]
    Shared,
    /// `keccak256(salt ++ record name)`, for contracts deployed several times
    /// with identical init code.
    Derived,
}

/// The unit of work of a step.
#[derive(Clone)]
pub enum StepAction {
    /// Deploy `contract` through the CREATE2 factory and record it under the step name.
    Create2 {
        contract: String,
        kind: ContractKind,
        constructor_args: EncodeFn,
        salt: SaltMode,
    },
    /// Call an existing contract. Outputs come from the receipt.
    Call {
        target: TargetFn,
        calldata: EncodeFn,
        extract: ExtractFn,
    },
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Create2 {
                contract,
                kind,
                salt,
                ..
            } => f
                .debug_struct("Create2")
                .field("contract", contract)
                .field("kind", kind)
                .field("salt", salt)
                .finish_non_exhaustive(),
            StepAction::Call { .. } => f.debug_struct("Call").finish_non_exhaustive(),
        }
    }
}

/// A named deployment step.
///
/// Its nonce offset is not part of the definition: it is the step's position
/// among the steps of its group that need a transaction, in declaration order.
#[derive(Debug, Clone)]
pub struct DeploymentStep {
    name: String,
    dependencies: Vec<String>,
    outputs: Vec<String>,
    gas_limit: Option<u64>,
    action: StepAction,
}

impl DeploymentStep {
    /// A CREATE2 deployment of `contract` recorded under `name`, without
    /// constructor arguments.
    pub fn create2(name: impl Into<String>, contract: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            outputs: vec![name.clone()],
            name,
            dependencies: Vec::new(),
            gas_limit: None,
            action: StepAction::Create2 {
                contract: contract.into(),
                kind: ContractKind::Implementation,
                constructor_args: Arc::new(|_| Ok(Bytes::new())),
                salt: SaltMode::Shared,
            },
        }
    }

    /// A call whose receipt yields the named `outputs`.
    pub fn call<T, D, E>(
        name: impl Into<String>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        target: T,
        calldata: D,
        extract: E,
    ) -> Self
    where
        T: Fn(&AddressRegistry) -> Result<Address> + Send + Sync + 'static,
        D: Fn(&AddressRegistry) -> Result<Bytes> + Send + Sync + 'static,
        E: Fn(&AddressRegistry, &Receipt) -> Result<Vec<AddressRecord>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            gas_limit: None,
            action: StepAction::Call {
                target: Arc::new(target),
                calldata: Arc::new(calldata),
                extract: Arc::new(extract),
            },
        }
    }

    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    /// Set the record kind of a CREATE2 step. No effect on calls.
    pub fn kind(mut self, kind: ContractKind) -> Self {
        if let StepAction::Create2 { kind: k, .. } = &mut self.action {
            *k = kind;
        }
        self
    }

    /// Constructor arguments of a CREATE2 step. No effect on calls.
    pub fn constructor_args<F>(mut self, args: F) -> Self
    where
        F: Fn(&AddressRegistry) -> Result<Bytes> + Send + Sync + 'static,
    {
        if let StepAction::Create2 {
            constructor_args, ..
        } = &mut self.action
        {
            *constructor_args = Arc::new(args);
        }
        self
    }

    /// Use a salt derived from the record name. No effect on calls.
    pub fn derived_salt(mut self) -> Self {
        if let StepAction::Create2 { salt, .. } = &mut self.action {
            *salt = SaltMode::Derived;
        }
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Registry names this step produces.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn requested_gas_limit(&self) -> Option<u64> {
        self.gas_limit
    }

    pub fn action(&self) -> &StepAction {
        &self.action
    }

    /// Whether every output is already recorded. Steps without outputs never are.
    pub fn is_recorded(&self, registry: &AddressRegistry) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|name| registry.contains(name))
    }
}

/// An ordered set of steps forming a DAG.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: DeploymentStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: DeploymentStep) {
        self.steps.push(step);
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[DeploymentStep] {
        &self.steps
    }

    pub fn get(&self, name: &str) -> Option<&DeploymentStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check names are unique, dependencies exist and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        let index = self.index()?;
        for step in &self.steps {
            for dependency in &step.dependencies {
                if !index.contains_key(dependency.as_str()) {
                    return Err(DeployError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = self.find_cycle(&index) {
            return Err(DeployError::DependencyCycle { steps: cycle });
        }
        Ok(())
    }

    /// Group layering of a fresh run, without touching the chain.
    pub fn layers(&self) -> Result<Vec<Vec<&str>>> {
        Ok(self
            .layers_from(&BTreeSet::new())?
            .into_iter()
            .map(|layer| layer.into_iter().map(|i| self.steps[i].name.as_str()).collect())
            .collect())
    }

    /// Repeated topological layering: each layer holds every step whose
    /// dependencies are all in `done` or in an earlier layer, in declaration
    /// order. Steps already in `done` are left out.
    pub fn layers_from(&self, done: &BTreeSet<String>) -> Result<Vec<Vec<usize>>> {
        self.validate()?;

        let mut settled: BTreeSet<&str> = done.iter().map(String::as_str).collect();
        let mut remaining: Vec<usize> = (0..self.steps.len())
            .filter(|&i| !settled.contains(self.steps[i].name.as_str()))
            .collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining.into_iter().partition(|&i| {
                self.steps[i]
                    .dependencies
                    .iter()
                    .all(|dependency| settled.contains(dependency.as_str()))
            });
            if ready.is_empty() {
                // Unreachable after validation.
                return Err(DeployError::DependencyCycle {
                    steps: blocked.iter().map(|&i| self.steps[i].name.clone()).collect(),
                });
            }
            settled.extend(ready.iter().map(|&i| self.steps[i].name.as_str()));
            layers.push(ready);
            remaining = blocked;
        }
        Ok(layers)
    }

    fn index(&self) -> Result<HashMap<&str, usize>> {
        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(DeployError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(index)
    }

    /// First cycle found by depth-first search, as `a -> b -> ... -> a`.
    fn find_cycle(&self, index: &HashMap<&str, usize>) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            plan: &DeploymentPlan,
            index: &HashMap<&str, usize>,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::Active;
            path.push(node);
            for dependency in &plan.steps[node].dependencies {
                let Some(&next) = index.get(dependency.as_str()) else {
                    continue;
                };
                match marks[next] {
                    Mark::Active => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&n| plan.steps[n].name.clone())
                            .collect();
                        cycle.push(plan.steps[next].name.clone());
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(plan, index, next, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.steps.len()];
        let mut path = Vec::new();
        for node in 0..self.steps.len() {
            if marks[node] == Mark::New {
                if let Some(cycle) = visit(self, index, node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}
