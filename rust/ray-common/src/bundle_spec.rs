// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement-group bundle specifications and the resource tagging convention.
//!
//! When a bundle is committed on a node, its plain demand (e.g. `CPU: 2`) is
//! re-published under placement-group specific names so that only tasks of
//! that group can consume it:
//!
//! - indexed: `CPU_group_<pg_hex>_<bundle_index>` (this bundle only)
//! - wildcard: `CPU_group_<pg_hex>` (any bundle of the group)
//!
//! Each bundle also carries the synthetic `bundle` resource under both names.

use std::fmt;

use crate::constants::{
    BUNDLE_RESOURCE_AMOUNT, BUNDLE_RESOURCE_LABEL, PLACEMENT_GROUP_RESOURCE_INFIX,
};
use crate::id::{BundleID, NodeID, PlacementGroupID};
use crate::scheduling::{FixedPoint, ResourceSet};

/// One bundle of a placement group: a resource demand plus the node it is
/// currently assigned to, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSpecification {
    bundle_id: BundleID,
    unit_resources: ResourceSet,
    node_id: Option<NodeID>,
}

impl BundleSpecification {
    pub fn new(pg_id: PlacementGroupID, bundle_index: i64, unit_resources: ResourceSet) -> Self {
        Self {
            bundle_id: (pg_id, bundle_index),
            unit_resources,
            node_id: None,
        }
    }

    pub fn bundle_id(&self) -> BundleID {
        self.bundle_id
    }

    pub fn placement_group_id(&self) -> PlacementGroupID {
        self.bundle_id.0
    }

    pub fn index(&self) -> i64 {
        self.bundle_id.1
    }

    /// The plain resource demand of this bundle.
    pub fn get_required_resources(&self) -> &ResourceSet {
        &self.unit_resources
    }

    pub fn node_id(&self) -> Option<NodeID> {
        self.node_id
    }

    pub fn set_node_id(&mut self, node_id: NodeID) {
        self.node_id = Some(node_id);
    }

    pub fn clear_node_id(&mut self) {
        self.node_id = None;
    }

    pub fn is_placed(&self) -> bool {
        self.node_id.is_some()
    }

    /// The tagged resources a node exposes once this bundle is committed.
    pub fn get_formatted_resources(&self) -> ResourceSet {
        let pg_id = self.placement_group_id();
        let index = self.index();
        let mut formatted = ResourceSet::new();
        let bundle_amount = FixedPoint::from_f64(BUNDLE_RESOURCE_AMOUNT);
        let demands = self
            .unit_resources
            .iter()
            .chain(std::iter::once((BUNDLE_RESOURCE_LABEL, bundle_amount)));
        for (name, amount) in demands {
            formatted.set(
                format_placement_group_resource(name, &pg_id, Some(index)),
                amount,
            );
            formatted.set(format_placement_group_resource(name, &pg_id, None), amount);
        }
        formatted
    }
}

impl fmt::Display for BundleSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundle {}:{}", self.placement_group_id(), self.index())
    }
}

/// Tag `resource` with a placement group, optionally pinned to one bundle.
pub fn format_placement_group_resource(
    resource: &str,
    pg_id: &PlacementGroupID,
    bundle_index: Option<i64>,
) -> String {
    match bundle_index {
        Some(index) => format!(
            "{resource}{PLACEMENT_GROUP_RESOURCE_INFIX}{}_{index}",
            pg_id.hex()
        ),
        None => format!("{resource}{PLACEMENT_GROUP_RESOURCE_INFIX}{}", pg_id.hex()),
    }
}

/// A tagged resource name split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGroupResource {
    pub original_resource: String,
    pub placement_group_id: PlacementGroupID,
    pub bundle_index: Option<i64>,
}

/// Parse a tagged resource name. Returns `None` for plain resources.
pub fn parse_placement_group_resource(name: &str) -> Option<PlacementGroupResource> {
    let split = name.rfind(PLACEMENT_GROUP_RESOURCE_INFIX)?;
    let original = &name[..split];
    let suffix = &name[split + PLACEMENT_GROUP_RESOURCE_INFIX.len()..];
    if original.is_empty() {
        return None;
    }
    let hex_len = PlacementGroupID::SIZE * 2;
    let (pg_hex, bundle_index) = if suffix.len() == hex_len {
        (suffix, None)
    } else {
        let pg_hex = suffix.get(..hex_len)?;
        let index = suffix.get(hex_len..)?.strip_prefix('_')?.parse::<i64>().ok()?;
        (pg_hex, Some(index))
    };
    if !pg_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(PlacementGroupResource {
        original_resource: original.to_string(),
        placement_group_id: PlacementGroupID::from_hex(pg_hex),
        bundle_index,
    })
}

/// Whether `name` is a wildcard resource, i.e. tagged with a placement group
/// but not with a bundle index.
pub fn is_placement_group_wildcard_resource(name: &str) -> bool {
    parse_placement_group_resource(name).is_some_and(|r| r.bundle_index.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::JobID;

    fn cpu_bundle(pg_id: PlacementGroupID, index: i64, cpu: f64) -> BundleSpecification {
        BundleSpecification::new(pg_id, index, ResourceSet::from_pairs([("CPU", cpu)]))
    }

    #[test]
    fn test_format_names() {
        let pg_id = PlacementGroupID::of(&JobID::from_int(1));
        assert_eq!(
            format_placement_group_resource("CPU", &pg_id, Some(3)),
            format!("CPU_group_{}_3", pg_id.hex())
        );
        assert_eq!(
            format_placement_group_resource("CPU", &pg_id, None),
            format!("CPU_group_{}", pg_id.hex())
        );
    }

    #[test]
    fn test_formatted_resources_of_cpu_bundle() {
        let pg_id = PlacementGroupID::of(&JobID::from_int(1));
        let bundle = cpu_bundle(pg_id, 0, 2.0);
        let formatted = bundle.get_formatted_resources();
        assert_eq!(formatted.len(), 4);
        assert_eq!(
            formatted
                .get(&format_placement_group_resource("CPU", &pg_id, Some(0)))
                .to_f64(),
            2.0
        );
        assert_eq!(
            formatted
                .get(&format_placement_group_resource("bundle", &pg_id, None))
                .to_f64(),
            BUNDLE_RESOURCE_AMOUNT
        );
        let wildcards = formatted
            .names()
            .filter(|name| is_placement_group_wildcard_resource(name))
            .count();
        assert_eq!(wildcards, 2);
    }

    #[test]
    fn test_parse_round_trips_index() {
        let pg_id = PlacementGroupID::of(&JobID::from_int(5));
        let parsed =
            parse_placement_group_resource(&format_placement_group_resource("GPU", &pg_id, Some(12)))
                .unwrap();
        assert_eq!(parsed.original_resource, "GPU");
        assert_eq!(parsed.placement_group_id, pg_id);
        assert_eq!(parsed.bundle_index, Some(12));
    }

    #[test]
    fn test_plain_resources_are_not_wildcards() {
        assert!(!is_placement_group_wildcard_resource("CPU"));
        assert!(!is_placement_group_wildcard_resource("my_group_resource"));
        assert!(!is_placement_group_wildcard_resource("_group_"));
        let pg_id = PlacementGroupID::of(&JobID::from_int(2));
        let indexed = format_placement_group_resource("CPU", &pg_id, Some(0));
        assert!(!is_placement_group_wildcard_resource(&indexed));
    }

    #[test]
    fn test_node_assignment() {
        let mut bundle = cpu_bundle(PlacementGroupID::of(&JobID::from_int(1)), 1, 1.0);
        assert!(!bundle.is_placed());
        let node = NodeID::from_random();
        bundle.set_node_id(node);
        assert_eq!(bundle.node_id(), Some(node));
        bundle.clear_node_id();
        assert!(bundle.node_id().is_none());
    }
}
