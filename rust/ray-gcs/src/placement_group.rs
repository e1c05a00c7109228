// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-memory placement group model used by the scheduler.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use ray_common::bundle_spec::BundleSpecification;
use ray_common::id::{NodeID, PlacementGroupID};
use ray_common::scheduling::ResourceSet;

/// How the bundles of a group may be spread over nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PlacementStrategy {
    Pack = 0,
    Spread = 1,
    StrictPack = 2,
    StrictSpread = 3,
}

impl From<i32> for PlacementStrategy {
    fn from(v: i32) -> Self {
        match v {
            1 => PlacementStrategy::Spread,
            2 => PlacementStrategy::StrictPack,
            3 => PlacementStrategy::StrictSpread,
            _ => PlacementStrategy::Pack,
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlacementStrategy::Pack => "PACK",
            PlacementStrategy::Spread => "SPREAD",
            PlacementStrategy::StrictPack => "STRICT_PACK",
            PlacementStrategy::StrictSpread => "STRICT_SPREAD",
        };
        f.write_str(name)
    }
}

/// Placement group states matching the protobuf enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PlacementGroupState {
    Pending = 0,
    Prepared = 1,
    Created = 2,
    Removed = 3,
    Rescheduling = 4,
}

impl From<i32> for PlacementGroupState {
    fn from(v: i32) -> Self {
        match v {
            0 => PlacementGroupState::Pending,
            1 => PlacementGroupState::Prepared,
            2 => PlacementGroupState::Created,
            4 => PlacementGroupState::Rescheduling,
            _ => PlacementGroupState::Removed,
        }
    }
}

/// A placement group as tracked by the GCS.
///
/// The scheduler only writes the bundles' node assignments and the state tag.
pub struct GcsPlacementGroup {
    placement_group_id: PlacementGroupID,
    name: String,
    strategy: PlacementStrategy,
    bundles: RwLock<Vec<BundleSpecification>>,
    state: RwLock<PlacementGroupState>,
}

impl GcsPlacementGroup {
    /// Create a pending group with one bundle per entry of `bundles`.
    pub fn new(
        placement_group_id: PlacementGroupID,
        name: impl Into<String>,
        strategy: PlacementStrategy,
        bundles: Vec<ResourceSet>,
    ) -> Self {
        let bundles = bundles
            .into_iter()
            .enumerate()
            .map(|(index, resources)| {
                BundleSpecification::new(placement_group_id, index as i64, resources)
            })
            .collect();
        Self {
            placement_group_id,
            name: name.into(),
            strategy,
            bundles: RwLock::new(bundles),
            state: RwLock::new(PlacementGroupState::Pending),
        }
    }

    pub fn placement_group_id(&self) -> PlacementGroupID {
        self.placement_group_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    pub fn state(&self) -> PlacementGroupState {
        *self.state.read()
    }

    pub fn update_state(&self, state: PlacementGroupState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!(
                pg_id = ?self.placement_group_id,
                from = ?*current,
                to = ?state,
                "Placement group state changed"
            );
            *current = state;
        }
    }

    pub fn num_bundles(&self) -> usize {
        self.bundles.read().len()
    }

    /// Snapshot of every bundle.
    pub fn get_bundles(&self) -> Vec<Arc<BundleSpecification>> {
        self.bundles.read().iter().cloned().map(Arc::new).collect()
    }

    /// Snapshot of the bundles without a node assignment, in index order.
    pub fn get_unplaced_bundles(&self) -> Vec<Arc<BundleSpecification>> {
        self.bundles
            .read()
            .iter()
            .filter(|bundle| !bundle.is_placed())
            .cloned()
            .map(Arc::new)
            .collect()
    }

    /// Nodes hosting at least one placed bundle of this group.
    pub fn get_placed_nodes(&self) -> Vec<NodeID> {
        let mut nodes: Vec<NodeID> = self
            .bundles
            .read()
            .iter()
            .filter_map(BundleSpecification::node_id)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn get_bundle(&self, index: i64) -> Option<BundleSpecification> {
        let bundles = self.bundles.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| bundles.get(i))
            .cloned()
    }

    /// Assign bundle `index` to `node_id`. Returns false for an unknown index.
    pub fn set_bundle_node(&self, index: i64, node_id: NodeID) -> bool {
        self.with_bundle_mut(index, |bundle| bundle.set_node_id(node_id))
    }

    /// Mark bundle `index` as unplaced. Returns false for an unknown index.
    pub fn clear_bundle_node(&self, index: i64) -> bool {
        self.with_bundle_mut(index, BundleSpecification::clear_node_id)
    }

    pub fn has_unplaced_bundles(&self) -> bool {
        self.bundles.read().iter().any(|bundle| !bundle.is_placed())
    }

    pub fn debug_string(&self) -> String {
        let bundles = self.bundles.read();
        let placed = bundles.iter().filter(|b| b.is_placed()).count();
        format!(
            "GcsPlacementGroup {{id: {}, name: {:?}, strategy: {}, state: {:?}, placed: {}/{}}}",
            self.placement_group_id,
            self.name,
            self.strategy,
            self.state(),
            placed,
            bundles.len()
        )
    }

    fn with_bundle_mut(&self, index: i64, f: impl FnOnce(&mut BundleSpecification)) -> bool {
        let mut bundles = self.bundles.write();
        match usize::try_from(index).ok().and_then(|i| bundles.get_mut(i)) {
            Some(bundle) => {
                f(bundle);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for GcsPlacementGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_common::id::JobID;

    fn make_group(strategy: PlacementStrategy, count: usize) -> GcsPlacementGroup {
        GcsPlacementGroup::new(
            PlacementGroupID::of(&JobID::from_int(1)),
            "pg",
            strategy,
            vec![ResourceSet::from_pairs([("CPU", 1.0)]); count],
        )
    }

    #[test]
    fn test_new_group_is_pending_and_unplaced() {
        let pg = make_group(PlacementStrategy::Spread, 3);
        assert_eq!(pg.state(), PlacementGroupState::Pending);
        assert_eq!(pg.num_bundles(), 3);
        let unplaced = pg.get_unplaced_bundles();
        assert_eq!(unplaced.len(), 3);
        assert_eq!(unplaced[2].index(), 2);
        assert!(unplaced.iter().all(|b| b.placement_group_id() == pg.placement_group_id()));
    }

    #[test]
    fn test_assign_and_clear_bundles() {
        let pg = make_group(PlacementStrategy::Pack, 2);
        let node = NodeID::from_random();

        assert!(pg.set_bundle_node(1, node));
        assert!(!pg.set_bundle_node(2, node));
        assert!(!pg.set_bundle_node(-1, node));

        let unplaced = pg.get_unplaced_bundles();
        assert_eq!(unplaced.len(), 1);
        assert_eq!(unplaced[0].index(), 0);
        assert_eq!(pg.get_placed_nodes(), vec![node]);
        assert_eq!(pg.get_bundle(1).unwrap().node_id(), Some(node));

        assert!(pg.clear_bundle_node(1));
        assert!(pg.get_placed_nodes().is_empty());
        assert!(pg.has_unplaced_bundles());
    }

    #[test]
    fn test_state_and_enum_conversions() {
        let pg = make_group(PlacementStrategy::StrictSpread, 1);
        pg.update_state(PlacementGroupState::Prepared);
        pg.update_state(PlacementGroupState::Created);
        assert_eq!(pg.state(), PlacementGroupState::Created);
        assert!(pg.debug_string().contains("STRICT_SPREAD"));

        assert_eq!(PlacementStrategy::from(2), PlacementStrategy::StrictPack);
        assert_eq!(PlacementGroupState::from(4), PlacementGroupState::Rescheduling);
        assert_eq!(PlacementGroupState::from(42), PlacementGroupState::Removed);
    }
}
