// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Two-way index of committed bundle locations.
//!
//! The forward map answers "where are the bundles of this placement group",
//! the reverse map answers "which bundles live on this node". Both are
//! updated together. The index holds no lock of its own; the scheduler
//! serializes access to it.

use std::collections::HashMap;
use std::sync::Arc;

use ray_common::bundle_spec::BundleSpecification;
use ray_common::id::{BundleID, NodeID, PlacementGroupID};

/// Where one bundle is committed, plus its specification.
pub type BundleLocation = (NodeID, Arc<BundleSpecification>);

/// A set of bundle locations, keyed by bundle ID.
pub type BundleLocations = HashMap<BundleID, BundleLocation>;

#[derive(Debug, Default)]
pub struct BundleLocationIndex {
    placement_group_to_bundle_locations: HashMap<PlacementGroupID, BundleLocations>,
    node_to_leased_bundles: HashMap<NodeID, BundleLocations>,
}

impl BundleLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `locations` into the entries of `pg_id` and of every referenced node.
    pub fn add_bundle_locations(&mut self, pg_id: PlacementGroupID, locations: &BundleLocations) {
        for (bundle_id, (node_id, spec)) in locations {
            self.add_bundle_location(pg_id, *bundle_id, *node_id, Arc::clone(spec));
        }
    }

    /// Record a single bundle location.
    pub fn add_bundle_location(
        &mut self,
        pg_id: PlacementGroupID,
        bundle_id: BundleID,
        node_id: NodeID,
        spec: Arc<BundleSpecification>,
    ) {
        let previous_node = self
            .placement_group_to_bundle_locations
            .get(&pg_id)
            .and_then(|forward| forward.get(&bundle_id))
            .map(|(node, _)| *node);
        if let Some(previous_node) = previous_node {
            debug_assert_eq!(
                previous_node, node_id,
                "bundle {bundle_id:?} is already located on another node"
            );
            if previous_node != node_id {
                tracing::warn!(
                    ?pg_id,
                    bundle_index = bundle_id.1,
                    ?previous_node,
                    ?node_id,
                    "Bundle moved between nodes without being removed first"
                );
                self.remove_from_node(&previous_node, &bundle_id);
            }
        }

        let location = (node_id, spec);
        self.placement_group_to_bundle_locations
            .entry(pg_id)
            .or_default()
            .insert(bundle_id, location.clone());
        self.node_to_leased_bundles
            .entry(node_id)
            .or_default()
            .insert(bundle_id, location);
    }

    pub fn get_bundle_locations(&self, pg_id: &PlacementGroupID) -> Option<&BundleLocations> {
        self.placement_group_to_bundle_locations.get(pg_id)
    }

    pub fn get_bundle_locations_on_node(&self, node_id: &NodeID) -> Option<&BundleLocations> {
        self.node_to_leased_bundles.get(node_id)
    }

    /// Remove every location of `pg_id`. Node entries left empty are deleted.
    /// Returns the removed locations.
    pub fn erase_placement_group(&mut self, pg_id: &PlacementGroupID) -> Option<BundleLocations> {
        let locations = self.placement_group_to_bundle_locations.remove(pg_id)?;
        for (bundle_id, (node_id, _)) in &locations {
            self.remove_from_node(node_id, bundle_id);
        }
        Some(locations)
    }

    /// Remove one bundle from both maps. Entries left empty are deleted.
    pub fn remove_bundle_location(&mut self, bundle_id: &BundleID) -> Option<BundleLocation> {
        let pg_id = bundle_id.0;
        let forward = self.placement_group_to_bundle_locations.get_mut(&pg_id)?;
        let location = forward.remove(bundle_id)?;
        if forward.is_empty() {
            self.placement_group_to_bundle_locations.remove(&pg_id);
        }
        self.remove_from_node(&location.0, bundle_id);
        Some(location)
    }

    /// Remove every location on `node_id`. Placement-group entries are pruned
    /// but kept even when they become empty. Returns the removed locations.
    pub fn erase_node(&mut self, node_id: &NodeID) -> Option<BundleLocations> {
        let locations = self.node_to_leased_bundles.remove(node_id)?;
        for bundle_id in locations.keys() {
            if let Some(forward) = self.placement_group_to_bundle_locations.get_mut(&bundle_id.0) {
                forward.remove(bundle_id);
            }
        }
        Some(locations)
    }

    /// Remove every location on `node_id` and report the bundle indexes that
    /// were there, grouped by placement group.
    pub fn get_and_remove_bundles_on_node(
        &mut self,
        node_id: &NodeID,
    ) -> HashMap<PlacementGroupID, Vec<i64>> {
        let mut bundles_on_node: HashMap<PlacementGroupID, Vec<i64>> = HashMap::new();
        if let Some(locations) = self.erase_node(node_id) {
            for (pg_id, index) in locations.into_keys() {
                bundles_on_node.entry(pg_id).or_default().push(index);
            }
        }
        for indexes in bundles_on_node.values_mut() {
            indexes.sort_unstable();
        }
        bundles_on_node
    }

    /// Number of placement groups with a forward entry.
    pub fn num_placement_groups(&self) -> usize {
        self.placement_group_to_bundle_locations.len()
    }

    pub fn debug_string(&self) -> String {
        let num_bundles: usize = self
            .placement_group_to_bundle_locations
            .values()
            .map(HashMap::len)
            .sum();
        format!(
            "BundleLocationIndex: {{placement groups: {}, nodes: {}, bundles: {}}}",
            self.placement_group_to_bundle_locations.len(),
            self.node_to_leased_bundles.len(),
            num_bundles
        )
    }

    fn remove_from_node(&mut self, node_id: &NodeID, bundle_id: &BundleID) {
        if let Some(on_node) = self.node_to_leased_bundles.get_mut(node_id) {
            on_node.remove(bundle_id);
            if on_node.is_empty() {
                self.node_to_leased_bundles.remove(node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_common::id::JobID;
    use ray_common::scheduling::ResourceSet;

    fn node_id(v: u8) -> NodeID {
        let mut data = [0u8; 28];
        data[0] = v;
        NodeID::from_binary(&data)
    }

    fn locations(pg_id: PlacementGroupID, nodes: &[NodeID]) -> BundleLocations {
        nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let spec = BundleSpecification::new(
                    pg_id,
                    index as i64,
                    ResourceSet::from_pairs([("CPU", 1.0)]),
                );
                (spec.bundle_id(), (*node, Arc::new(spec)))
            })
            .collect()
    }

    #[test]
    fn test_add_get_and_erase() {
        let mut index = BundleLocationIndex::new();
        let node1 = node_id(1);
        let node2 = node_id(2);
        let pg1 = PlacementGroupID::of(&JobID::from_int(1));
        let pg2 = PlacementGroupID::of(&JobID::from_int(1));

        index.add_bundle_locations(pg1, &locations(pg1, &[node1, node2]));
        index.add_bundle_locations(pg2, &locations(pg2, &[node1, node2]));

        let pg1_locations = index.get_bundle_locations(&pg1).unwrap();
        assert_eq!(pg1_locations.len(), 2);
        assert!(pg1_locations.contains_key(&(pg1, 0)));
        assert!(pg1_locations.contains_key(&(pg1, 1)));
        assert!(!pg1_locations.contains_key(&(pg2, 1)));

        let on_node1 = index.get_bundle_locations_on_node(&node1).unwrap();
        assert_eq!(on_node1.len(), 2);
        assert!(on_node1.contains_key(&(pg1, 0)));
        assert!(on_node1.contains_key(&(pg2, 0)));

        assert!(index.remove_bundle_location(&(pg1, 0)).is_some());
        assert!(index.remove_bundle_location(&(pg1, 1)).is_some());
        assert!(index.get_bundle_locations(&pg1).is_none());
        assert_eq!(index.get_bundle_locations(&pg2).unwrap().len(), 2);

        index.erase_node(&node1);
        assert!(index.get_bundle_locations_on_node(&node1).is_none());
        assert_eq!(index.get_bundle_locations(&pg2).unwrap().len(), 1);
        assert_eq!(index.get_bundle_locations_on_node(&node2).unwrap().len(), 1);
    }

    #[test]
    fn test_erase_group_drops_empty_node_entries() {
        let mut index = BundleLocationIndex::new();
        let pg = PlacementGroupID::of(&JobID::from_int(3));
        index.add_bundle_locations(pg, &locations(pg, &[node_id(1)]));

        assert!(index.erase_placement_group(&pg).is_some());
        assert!(index.get_bundle_locations_on_node(&node_id(1)).is_none());
        assert!(index.erase_placement_group(&pg).is_none());
    }

    #[test]
    fn test_remove_single_bundle() {
        let mut index = BundleLocationIndex::new();
        let pg = PlacementGroupID::of(&JobID::from_int(3));
        index.add_bundle_locations(pg, &locations(pg, &[node_id(1), node_id(2)]));

        let (node, spec) = index.remove_bundle_location(&(pg, 1)).unwrap();
        assert_eq!(node, node_id(2));
        assert_eq!(spec.index(), 1);
        // The sibling bundle is untouched.
        assert_eq!(index.get_bundle_locations(&pg).unwrap().len(), 1);
        assert!(index.get_bundle_locations_on_node(&node_id(2)).is_none());
        assert_eq!(index.get_bundle_locations_on_node(&node_id(1)).unwrap().len(), 1);
        assert!(index.remove_bundle_location(&(pg, 1)).is_none());

        index.remove_bundle_location(&(pg, 0));
        assert!(index.get_bundle_locations(&pg).is_none());
        assert!(index.get_bundle_locations_on_node(&node_id(1)).is_none());
        assert_eq!(index.num_placement_groups(), 0);
    }

    #[test]
    fn test_erase_node_keeps_empty_group_entry() {
        let mut index = BundleLocationIndex::new();
        let pg = PlacementGroupID::of(&JobID::from_int(3));
        index.add_bundle_locations(pg, &locations(pg, &[node_id(1), node_id(1)]));

        let removed = index.get_and_remove_bundles_on_node(&node_id(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[&pg], vec![0, 1]);
        assert!(index.get_bundle_locations(&pg).unwrap().is_empty());
        assert_eq!(index.num_placement_groups(), 1);

        assert!(index.get_and_remove_bundles_on_node(&node_id(1)).is_empty());
    }

    #[test]
    fn test_re_adding_same_location_is_idempotent() {
        let mut index = BundleLocationIndex::new();
        let pg = PlacementGroupID::of(&JobID::from_int(4));
        let locs = locations(pg, &[node_id(1), node_id(2)]);
        index.add_bundle_locations(pg, &locs);
        index.add_bundle_locations(pg, &locs);

        assert_eq!(index.get_bundle_locations(&pg).unwrap().len(), 2);
        assert_eq!(index.get_bundle_locations_on_node(&node_id(1)).unwrap().len(), 1);
        assert!(index.debug_string().contains("bundles: 2"));
    }
}
