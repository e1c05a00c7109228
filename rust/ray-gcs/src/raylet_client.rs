// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client seam between the placement group scheduler and node agents.

use std::sync::Arc;

use ray_common::bundle_spec::BundleSpecification;
use ray_common::id::NodeID;
use ray_common::status::RayResult;

/// Bundle RPCs the scheduler sends to raylets (mockable for tests).
///
/// Every call carries the bundles of one placement group destined for one
/// node. Errors are transport failures; a prepare the node declines is
/// `Ok(false)`.
#[async_trait::async_trait]
pub trait PlacementGroupRayletClient: Send + Sync {
    /// Reserve resources for `bundles` without exposing them yet.
    async fn prepare_bundle_resources(
        &self,
        node_id: &NodeID,
        bundles: Vec<Arc<BundleSpecification>>,
    ) -> RayResult<bool>;

    /// Turn prepared reservations into usable bundle resources.
    async fn commit_bundle_resources(
        &self,
        node_id: &NodeID,
        bundles: Vec<Arc<BundleSpecification>>,
    ) -> RayResult<()>;

    /// Undo a prepared or committed reservation.
    async fn cancel_resource_reserve(
        &self,
        node_id: &NodeID,
        bundles: Vec<Arc<BundleSpecification>>,
    ) -> RayResult<()>;

    /// Tell a node which bundles are still in use; it frees all others.
    async fn release_unused_bundles(
        &self,
        node_id: &NodeID,
        bundles_in_use: Vec<Arc<BundleSpecification>>,
    ) -> RayResult<()>;
}
