// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cluster resource manager: the GCS-side view of every node's resources.
//!
//! Placement-group scheduling reserves capacity here speculatively before any
//! node has been asked, so concurrent scheduling attempts see each other's
//! holds. Committed bundles additionally publish tagged resources
//! (see [`ray_common::bundle_spec`]) on the node's total and available sets.

use std::collections::HashMap;

use parking_lot::RwLock;
use ray_common::id::NodeID;
use ray_common::scheduling::ResourceSet;

/// Total and currently available resources of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResources {
    pub total: ResourceSet,
    pub available: ResourceSet,
}

impl NodeResources {
    pub fn new(total: ResourceSet) -> Self {
        Self {
            available: total.clone(),
            total,
        }
    }
}

/// The resource view of every node known to the scheduler.
pub struct ClusterResourceManager {
    nodes: RwLock<HashMap<NodeID, NodeResources>>,
}

impl ClusterResourceManager {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Add a node with all of `total` available, or reset an existing one.
    pub fn add_or_update_node(&self, node_id: NodeID, total: ResourceSet) {
        self.nodes.write().insert(node_id, NodeResources::new(total));
    }

    pub fn remove_node(&self, node_id: &NodeID) -> bool {
        self.nodes.write().remove(node_id).is_some()
    }

    /// Snapshot of all nodes, taken once per scheduling attempt.
    pub fn get_resource_view(&self) -> HashMap<NodeID, NodeResources> {
        self.nodes.read().clone()
    }

    pub fn get_available(&self, node_id: &NodeID) -> Option<ResourceSet> {
        self.nodes.read().get(node_id).map(|n| n.available.clone())
    }

    pub fn get_total(&self, node_id: &NodeID) -> Option<ResourceSet> {
        self.nodes.read().get(node_id).map(|n| n.total.clone())
    }

    /// Speculatively take `request` out of a node's available resources.
    /// Refuses (and changes nothing) unless the whole request fits.
    pub fn subtract_node_available_resources(&self, node_id: &NodeID, request: &ResourceSet) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(node_id) else {
            return false;
        };
        if !node.available.is_superset_of(request) {
            return false;
        }
        node.available.subtract(request);
        true
    }

    /// Give `resources` back to a node's available set, never exceeding its total.
    pub fn add_node_available_resources(&self, node_id: &NodeID, resources: &ResourceSet) -> bool {
        let mut nodes = self.nodes.write();
        let Some(NodeResources { total, available }) = nodes.get_mut(node_id) else {
            return false;
        };
        available.add_capped(resources, total);
        true
    }

    /// Publish the tagged resources of a committed bundle on both total and
    /// available.
    pub fn add_bundle_resources(&self, node_id: &NodeID, formatted: &ResourceSet) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(node_id) else {
            return false;
        };
        node.total.add(formatted);
        node.available.add(formatted);
        true
    }

    /// Withdraw the tagged resources of a bundle from both total and available.
    pub fn remove_bundle_resources(&self, node_id: &NodeID, formatted: &ResourceSet) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(node_id) else {
            return false;
        };
        node.total.subtract(formatted);
        node.available.subtract(formatted);
        true
    }

    /// Whether any resource named in `resources` is partly consumed on the
    /// node, i.e. its available amount is below its total. Unknown nodes are
    /// never in use.
    pub fn is_resource_in_use(&self, node_id: &NodeID, resources: &ResourceSet) -> bool {
        let nodes = self.nodes.read();
        let Some(node) = nodes.get(node_id) else {
            return false;
        };
        resources
            .names()
            .any(|name| node.available.get(name) < node.total.get(name))
    }
}

impl Default for ClusterResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_common::scheduling::FixedPoint;

    fn node_id(v: u8) -> NodeID {
        let mut data = [0u8; 28];
        data[0] = v;
        NodeID::from_binary(&data)
    }

    fn cpus(amount: f64) -> ResourceSet {
        ResourceSet::from_pairs([("CPU", amount)])
    }

    #[test]
    fn test_add_and_remove_node() {
        let mgr = ClusterResourceManager::new();
        mgr.add_or_update_node(node_id(1), cpus(4.0));
        assert_eq!(mgr.get_total(&node_id(1)), Some(cpus(4.0)));

        assert!(mgr.remove_node(&node_id(1)));
        assert!(mgr.get_total(&node_id(1)).is_none());
        assert!(!mgr.remove_node(&node_id(1)));
    }

    #[test]
    fn test_subtract_and_add_resources() {
        let mgr = ClusterResourceManager::new();
        mgr.add_or_update_node(node_id(1), cpus(4.0));

        assert!(mgr.subtract_node_available_resources(&node_id(1), &cpus(3.0)));
        assert_eq!(
            mgr.get_available(&node_id(1)).unwrap().get("CPU"),
            FixedPoint::from_f64(1.0)
        );

        // Does not fit: nothing changes.
        assert!(!mgr.subtract_node_available_resources(&node_id(1), &cpus(2.0)));
        assert_eq!(
            mgr.get_available(&node_id(1)).unwrap().get("CPU"),
            FixedPoint::from_f64(1.0)
        );

        // Adding back is capped at the total.
        mgr.add_node_available_resources(&node_id(1), &cpus(10.0));
        assert_eq!(mgr.get_available(&node_id(1)), mgr.get_total(&node_id(1)));
    }

    #[test]
    fn test_unknown_node() {
        let mgr = ClusterResourceManager::new();
        assert!(!mgr.subtract_node_available_resources(&node_id(1), &cpus(1.0)));
        assert!(!mgr.add_node_available_resources(&node_id(1), &cpus(1.0)));
        assert!(!mgr.is_resource_in_use(&node_id(1), &cpus(1.0)));
        assert!(mgr.get_total(&node_id(1)).is_none());
    }

    #[test]
    fn test_bundle_resources_and_in_use() {
        let mgr = ClusterResourceManager::new();
        mgr.add_or_update_node(node_id(1), cpus(4.0));
        let tagged = ResourceSet::from_pairs([("CPU_group_0", 2.0)]);

        mgr.add_bundle_resources(&node_id(1), &tagged);
        assert_eq!(mgr.get_total(&node_id(1)).unwrap().len(), 2);
        assert!(!mgr.is_resource_in_use(&node_id(1), &tagged));

        // A consumer takes part of the tagged resource.
        assert!(mgr.subtract_node_available_resources(
            &node_id(1),
            &ResourceSet::from_pairs([("CPU_group_0", 0.5)])
        ));
        assert!(mgr.is_resource_in_use(&node_id(1), &tagged));

        mgr.add_node_available_resources(&node_id(1), &tagged);
        assert!(!mgr.is_resource_in_use(&node_id(1), &tagged));

        mgr.remove_bundle_resources(&node_id(1), &tagged);
        assert_eq!(mgr.get_total(&node_id(1)), Some(cpus(4.0)));
        assert_eq!(mgr.get_available(&node_id(1)), Some(cpus(4.0)));
    }

    #[test]
    fn test_get_resource_view() {
        let mgr = ClusterResourceManager::new();
        mgr.add_or_update_node(node_id(1), cpus(4.0));
        mgr.add_or_update_node(node_id(2), cpus(8.0));

        assert!(mgr.subtract_node_available_resources(&node_id(2), &cpus(2.0)));

        let view = mgr.get_resource_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[&node_id(2)].total, cpus(8.0));
        assert_eq!(view[&node_id(2)].available, cpus(6.0));
        assert_eq!(view[&node_id(1)].available, cpus(4.0));
    }
}
