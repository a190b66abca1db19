//! Diamond facet state and cut computation.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::{
    primitives::{Address, Bytes, Selector},
    sol,
    sol_types::SolCall,
};

use crate::{
    chain::{CallRequest, ChainClient},
    error::{DeployError, Result},
};

sol! {
    #![sol(all_derives)]

    interface IDiamondCut {
        enum FacetCutAction {
            Add,
            Replace,
            Remove
        }

        struct FacetCut {
            address facetAddress;
            FacetCutAction action;
            bytes4[] functionSelectors;
        }

        struct DiamondCutData {
            FacetCut[] facetCuts;
            address initAddress;
            bytes initCalldata;
        }

        function diamondCut(FacetCut[] _diamondCut, address _init, bytes _calldata) external;
    }

    interface IDiamondLoupe {
        struct Facet {
            address addr;
            bytes4[] selectors;
        }

        function facets() external view returns (Facet[] memory result);
    }
}

/// What a cut does with its selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum FacetAction {
    Add,
    Replace,
    Remove,
}

impl From<FacetAction> for IDiamondCut::FacetCutAction {
    fn from(action: FacetAction) -> Self {
        match action {
            FacetAction::Add => Self::Add,
            FacetAction::Replace => Self::Replace,
            FacetAction::Remove => Self::Remove,
        }
    }
}

/// One entry of a diamond cut. `Remove` entries carry the zero address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetCut {
    pub facet: Address,
    pub action: FacetAction,
    pub selectors: BTreeSet<Selector>,
}

impl From<&FacetCut> for IDiamondCut::FacetCut {
    fn from(cut: &FacetCut) -> Self {
        Self {
            facetAddress: cut.facet,
            action: cut.action.into(),
            functionSelectors: cut.selectors.iter().copied().collect(),
        }
    }
}

/// Installed facets of a diamond, as reported by its loupe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiamondState {
    facets: BTreeMap<Address, BTreeSet<Selector>>,
    owners: BTreeMap<Selector, Address>,
}

impl DiamondState {
    /// State of a diamond with no facets.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_facets<I, S>(facets: I) -> Self
    where
        I: IntoIterator<Item = (Address, S)>,
        S: IntoIterator<Item = Selector>,
    {
        let mut state = Self::default();
        for (facet, selectors) in facets {
            for selector in selectors {
                if let Some(owner) = state.owners.get(&selector) {
                    tracing::warn!(%selector, first = %owner, second = %facet, "Selector reported by two facets, keeping the first");
                    continue;
                }
                state.owners.insert(selector, facet);
                state.facets.entry(facet).or_default().insert(selector);
            }
        }
        state
    }

    pub fn owner_of(&self, selector: &Selector) -> Option<Address> {
        self.owners.get(selector).copied()
    }

    pub fn facets(&self) -> &BTreeMap<Address, BTreeSet<Selector>> {
        &self.facets
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn selector_count(&self) -> usize {
        self.owners.len()
    }
}

/// A facet the diamond should route to after the cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFacet {
    pub name: String,
    pub address: Address,
    pub selectors: BTreeSet<Selector>,
}

impl TargetFacet {
    pub fn new(
        name: impl Into<String>,
        address: Address,
        selectors: impl IntoIterator<Item = Selector>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            selectors: selectors.into_iter().collect(),
        }
    }
}

/// Minimal cut turning `current` into `target`.
///
/// Output order is Remove, then Replace, then Add, each sorted by facet
/// address (Remove entries by the facet that currently owns the selectors).
/// A selector claimed by two target facets is rejected before anything is
/// emitted.
pub fn compute_cut(current: &DiamondState, target: &[TargetFacet]) -> Result<Vec<FacetCut>> {
    let mut claimed: BTreeMap<Selector, &TargetFacet> = BTreeMap::new();
    for facet in target {
        if facet.address.is_zero() && !facet.selectors.is_empty() {
            return Err(DeployError::config(format!(
                "target facet `{}` has the zero address",
                facet.name
            )));
        }
        for selector in &facet.selectors {
            if let Some(first) = claimed.insert(*selector, facet) {
                if first.name != facet.name || first.address != facet.address {
                    return Err(DeployError::SelectorConflict {
                        selector: *selector,
                        first: format!("{} ({})", first.name, first.address),
                        second: format!("{} ({})", facet.name, facet.address),
                    });
                }
            }
        }
    }

    let mut removes: BTreeMap<Address, BTreeSet<Selector>> = BTreeMap::new();
    for (selector, owner) in &current.owners {
        if !claimed.contains_key(selector) {
            removes.entry(*owner).or_default().insert(*selector);
        }
    }

    let mut replaces: BTreeMap<Address, BTreeSet<Selector>> = BTreeMap::new();
    let mut adds: BTreeMap<Address, BTreeSet<Selector>> = BTreeMap::new();
    for (selector, facet) in &claimed {
        match current.owner_of(selector) {
            None => {
                adds.entry(facet.address).or_default().insert(*selector);
            }
            Some(owner) if owner != facet.address => {
                replaces.entry(facet.address).or_default().insert(*selector);
            }
            Some(_) => {}
        }
    }

    let cuts = removes
        .into_values()
        .map(|selectors| FacetCut {
            facet: Address::ZERO,
            action: FacetAction::Remove,
            selectors,
        })
        .chain(replaces.into_iter().map(|(facet, selectors)| FacetCut {
            facet,
            action: FacetAction::Replace,
            selectors,
        }))
        .chain(adds.into_iter().map(|(facet, selectors)| FacetCut {
            facet,
            action: FacetAction::Add,
            selectors,
        }))
        .collect();
    Ok(cuts)
}

/// `DiamondCutData` as passed to `newChain`.
pub fn cut_data(cuts: &[FacetCut], init: Address, init_calldata: Bytes) -> IDiamondCut::DiamondCutData {
    IDiamondCut::DiamondCutData {
        facetCuts: cuts.iter().map(Into::into).collect(),
        initAddress: init,
        initCalldata: init_calldata,
    }
}

/// Calldata for `diamondCut(cuts, init, initCalldata)`.
pub fn diamond_cut_calldata(cuts: &[FacetCut], init: Address, init_calldata: Bytes) -> Bytes {
    IDiamondCut::diamondCutCall {
        _diamondCut: cuts.iter().map(Into::into).collect(),
        _init: init,
        _calldata: init_calldata,
    }
    .abi_encode()
    .into()
}

/// Query the diamond's loupe for its current facets.
pub async fn fetch_diamond_state<C: ChainClient>(client: &C, diamond: Address) -> Result<DiamondState> {
    const METHOD: &str = "facets()";
    let output = client
        .call(CallRequest {
            from: None,
            to: diamond,
            data: IDiamondLoupe::facetsCall {}.abi_encode().into(),
        })
        .await?;
    let decoded = IDiamondLoupe::facetsCall::abi_decode_returns(&output, true)
        .map_err(|e| DeployError::rpc(METHOD, format!("failed to decode loupe output of {diamond}: {e}")))?;

    let state = DiamondState::from_facets(
        decoded
            .result
            .into_iter()
            .map(|facet| (facet.addr, facet.selectors)),
    );
    tracing::debug!(
        %diamond,
        facets = state.facets().len(),
        selectors = state.selector_count(),
        "Fetched diamond state"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::sol_types::SolValue;

    fn sel(byte: u8) -> Selector {
        Selector::repeat_byte(byte)
    }

    fn facet_a() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn facet_b() -> Address {
        Address::repeat_byte(0xbb)
    }

    #[test]
    fn test_new_facet_adds_only_its_selectors() {
        let current = DiamondState::from_facets([(facet_a(), [sel(1), sel(2)])]);
        let target = [
            TargetFacet::new("A", facet_a(), [sel(1), sel(2)]),
            TargetFacet::new("B", facet_b(), [sel(3)]),
        ];

        let cuts = compute_cut(&current, &target).unwrap();
        assert_eq!(
            cuts,
            vec![FacetCut {
                facet: facet_b(),
                action: FacetAction::Add,
                selectors: BTreeSet::from([sel(3)]),
            }]
        );
    }

    #[test]
    fn test_moved_selector_is_replaced() {
        let current = DiamondState::from_facets([(facet_a(), [sel(1)])]);
        let target = [TargetFacet::new("B", facet_b(), [sel(1)])];

        let cuts = compute_cut(&current, &target).unwrap();
        assert_eq!(
            cuts,
            vec![FacetCut {
                facet: facet_b(),
                action: FacetAction::Replace,
                selectors: BTreeSet::from([sel(1)]),
            }]
        );
    }

    #[test]
    fn test_dropped_selectors_are_removed_with_zero_address() {
        let current = DiamondState::from_facets([(facet_a(), vec![sel(1), sel(2)]), (facet_b(), vec![sel(3)])]);
        let target = [TargetFacet::new("A", facet_a(), [sel(1)])];

        let cuts = compute_cut(&current, &target).unwrap();
        assert_eq!(cuts.len(), 2);
        assert!(cuts.iter().all(|cut| cut.action == FacetAction::Remove));
        assert!(cuts.iter().all(|cut| cut.facet.is_zero()));
        // Grouped by previous owner, A before B.
        assert_eq!(cuts[0].selectors, BTreeSet::from([sel(2)]));
        assert_eq!(cuts[1].selectors, BTreeSet::from([sel(3)]));
    }

    #[test]
    fn test_cut_ordering_and_disjointness() {
        let c = Address::repeat_byte(0xcc);
        let current = DiamondState::from_facets([(facet_b(), vec![sel(1), sel(2)]), (facet_a(), vec![sel(9)])]);
        let target = [
            TargetFacet::new("C", c, [sel(1), sel(5)]),
            TargetFacet::new("A", facet_a(), [sel(2), sel(4)]),
        ];

        let cuts = compute_cut(&current, &target).unwrap();
        let actions: Vec<_> = cuts.iter().map(|cut| (cut.action, cut.facet)).collect();
        assert_eq!(
            actions,
            vec![
                (FacetAction::Remove, Address::ZERO),
                (FacetAction::Replace, facet_a()),
                (FacetAction::Replace, c),
                (FacetAction::Add, facet_a()),
                (FacetAction::Add, c),
            ]
        );

        let mut seen = BTreeSet::new();
        for cut in &cuts {
            for selector in &cut.selectors {
                assert!(seen.insert(*selector), "selector {selector} emitted twice");
            }
        }
    }

    #[test]
    fn test_identical_state_needs_no_cut() {
        let current = DiamondState::from_facets([(facet_a(), [sel(1), sel(2)])]);
        let target = [TargetFacet::new("A", facet_a(), [sel(2), sel(1)])];
        assert!(compute_cut(&current, &target).unwrap().is_empty());
    }

    #[test]
    fn test_selector_conflict_is_rejected() {
        let target = [
            TargetFacet::new("GettersFacet", facet_a(), [sel(1), sel(2)]),
            TargetFacet::new("ExecutorFacet", facet_b(), [sel(2)]),
        ];
        let err = compute_cut(&DiamondState::empty(), &target).unwrap_err();
        match err {
            DeployError::SelectorConflict {
                selector,
                first,
                second,
            } => {
                assert_eq!(selector, sel(2));
                assert_eq!(first, format!("GettersFacet ({})", facet_a()));
                assert_eq!(second, format!("ExecutorFacet ({})", facet_b()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            compute_cut(&DiamondState::empty(), &target)
                .unwrap_err()
                .is_configuration()
        );
    }

    #[test]
    fn test_same_name_at_two_addresses_conflicts() {
        let target = [
            TargetFacet::new("ExecutorFacet", facet_a(), [sel(1)]),
            TargetFacet::new("ExecutorFacet", facet_b(), [sel(1)]),
        ];
        let err = compute_cut(&DiamondState::empty(), &target).unwrap_err();
        assert!(matches!(err, DeployError::SelectorConflict { selector, .. } if selector == sel(1)));

        // The same facet listed twice is not a conflict.
        let repeated = [
            TargetFacet::new("ExecutorFacet", facet_a(), [sel(1)]),
            TargetFacet::new("ExecutorFacet", facet_a(), [sel(1)]),
        ];
        assert_eq!(compute_cut(&DiamondState::empty(), &repeated).unwrap().len(), 1);
    }

    #[test]
    fn test_cut_calldata_encodes_actions_in_order() {
        let cuts = compute_cut(
            &DiamondState::from_facets([(facet_a(), [sel(1)])]),
            &[TargetFacet::new("B", facet_b(), [sel(2)])],
        )
        .unwrap();
        let calldata = diamond_cut_calldata(&cuts, Address::repeat_byte(0x01), Bytes::from_static(&[0x12]));

        let decoded = IDiamondCut::diamondCutCall::abi_decode(&calldata, true).unwrap();
        assert_eq!(decoded._diamondCut.len(), 2);
        assert_eq!(decoded._diamondCut[0].action, IDiamondCut::FacetCutAction::Remove);
        assert_eq!(decoded._diamondCut[0].facetAddress, Address::ZERO);
        assert_eq!(decoded._diamondCut[1].action, IDiamondCut::FacetCutAction::Add);
        assert_eq!(decoded._diamondCut[1].functionSelectors, vec![sel(2)]);
        assert_eq!(decoded._init, Address::repeat_byte(0x01));
    }

    #[test]
    fn test_loupe_output_decoding() {
        let facets = vec![IDiamondLoupe::Facet {
            addr: facet_a(),
            selectors: vec![sel(1), sel(2)],
        }];
        let encoded = (facets,).abi_encode_params();
        let decoded = IDiamondLoupe::facetsCall::abi_decode_returns(&encoded, true).unwrap();
        let state = DiamondState::from_facets(decoded.result.into_iter().map(|f| (f.addr, f.selectors)));
        assert_eq!(state.owner_of(&sel(2)), Some(facet_a()));
        assert_eq!(state.selector_count(), 2);
    }
}
