// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement-group bundle scheduling for the Global Control Service (GCS).
//!
//! - `GcsPlacementGroupScheduler`: selects nodes for bundles and reserves
//!   them with a prepare/commit protocol against node agents
//! - `BundleLocationIndex`: where committed bundles live
//! - `ClusterResourceManager` / `GcsNodeManager`: the resource view and the
//!   set of alive nodes the scheduler reads

pub mod bundle_location_index;
pub mod bundle_scheduling_policy;
pub mod cluster_resource_manager;
pub mod lease_status_tracker;
pub mod node_manager;
pub mod placement_group;
pub mod placement_group_scheduler;
pub mod raylet_client;

pub use placement_group_scheduler::{
    FailureCallback, GcsPlacementGroupScheduler, SchedulePgRequest, SuccessCallback,
};
