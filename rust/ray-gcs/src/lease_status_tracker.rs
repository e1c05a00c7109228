// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-attempt bookkeeping for two-phase bundle reservation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ray_common::bundle_spec::BundleSpecification;
use ray_common::id::{BundleID, NodeID};
use ray_common::scheduling::ResourceSet;
use ray_util::time::Stopwatch;
use tokio::sync::Notify;

use crate::bundle_location_index::BundleLocations;
use crate::cluster_resource_manager::ClusterResourceManager;
use crate::placement_group::GcsPlacementGroup;

/// Where a scheduling attempt is in the prepare/commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPhase {
    Selecting,
    Preparing,
    Prepared,
    Committing,
    Succeeded,
    Failed,
}

impl SchedulingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulingPhase::Succeeded | SchedulingPhase::Failed)
    }

    fn can_move_to(self, next: SchedulingPhase) -> bool {
        use SchedulingPhase::*;
        matches!(
            (self, next),
            (Selecting, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Succeeded)
                | (Selecting | Preparing | Prepared | Committing, Failed)
        )
    }
}

// ─── AttemptHandle ─────────────────────────────────────────────────────────

/// The part of an attempt the scheduler reaches from outside the attempt's
/// task: cancellation and node-death wakeups.
pub struct AttemptHandle {
    cancelled: AtomicBool,
    nodes: BTreeSet<NodeID>,
    node_removed: Notify,
}

impl AttemptHandle {
    pub fn new(nodes: impl IntoIterator<Item = NodeID>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            nodes: nodes.into_iter().collect(),
            node_removed: Notify::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn depends_on(&self, node_id: &NodeID) -> bool {
        self.nodes.contains(node_id)
    }

    /// Wake the attempt if it has bundles on `node_id`. A wakeup sent while
    /// the attempt is not waiting is kept until it next waits.
    pub fn notify_node_removed(&self, node_id: &NodeID) -> bool {
        if !self.depends_on(node_id) {
            return false;
        }
        self.node_removed.notify_one();
        true
    }

    /// Resolves after a node of this attempt was removed. May also resolve
    /// for a removal already handled, so callers re-check liveness.
    pub async fn node_removed(&self) {
        self.node_removed.notified().await;
    }
}

// ─── ResourceHold ───────────────────────────────────────────────────────────

/// Resources speculatively taken out of the cluster view for one attempt.
///
/// Whatever is still held when the hold is dropped goes back to the view, so
/// every exit path returns it exactly once.
pub struct ResourceHold {
    resource_manager: Arc<ClusterResourceManager>,
    held: BTreeMap<NodeID, ResourceSet>,
}

impl ResourceHold {
    /// Subtract every `(node, demand)` from the view. If any subtraction is
    /// refused, everything taken so far is returned and `None` is the result.
    pub fn acquire<'a>(
        resource_manager: Arc<ClusterResourceManager>,
        demands: impl IntoIterator<Item = (NodeID, &'a ResourceSet)>,
    ) -> Option<Self> {
        let mut hold = Self {
            resource_manager,
            held: BTreeMap::new(),
        };
        for (node_id, demand) in demands {
            if !hold
                .resource_manager
                .subtract_node_available_resources(&node_id, demand)
            {
                tracing::debug!(?node_id, "Speculative subtract refused, rolling back hold");
                return None;
            }
            hold.held.entry(node_id).or_default().add(demand);
        }
        Some(hold)
    }

    /// Return the part held on `node_id` to the view.
    pub fn release_node(&mut self, node_id: &NodeID) {
        if let Some(resources) = self.held.remove(node_id) {
            self.resource_manager
                .add_node_available_resources(node_id, &resources);
        }
    }

    /// Stop tracking the part held on `node_id` without returning it; it now
    /// backs committed bundles.
    pub fn take_node(&mut self, node_id: &NodeID) -> Option<ResourceSet> {
        self.held.remove(node_id)
    }

    /// Return everything still held.
    pub fn release_all(&mut self) {
        let held = std::mem::take(&mut self.held);
        for (node_id, resources) in held {
            self.resource_manager
                .add_node_available_resources(&node_id, &resources);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn held_on(&self, node_id: &NodeID) -> Option<&ResourceSet> {
        self.held.get(node_id)
    }
}

impl Drop for ResourceHold {
    fn drop(&mut self) {
        self.release_all();
    }
}

// ─── LeaseStatusTracker ─────────────────────────────────────────────────────

/// State of one scheduling attempt of one placement group.
pub struct LeaseStatusTracker {
    placement_group: Arc<GcsPlacementGroup>,
    phase: SchedulingPhase,
    attempt: Arc<AttemptHandle>,
    /// Bundles of this attempt per selected node, in node order.
    node_batches: BTreeMap<NodeID, Vec<Arc<BundleSpecification>>>,
    prepared_nodes: Vec<NodeID>,
    committed: BundleLocations,
    uncommitted: Vec<BundleID>,
    hold: ResourceHold,
    stopwatch: Stopwatch,
}

impl LeaseStatusTracker {
    /// A tracker for bundles that have been selected and held, about to be
    /// prepared.
    pub fn new(
        placement_group: Arc<GcsPlacementGroup>,
        selections: Vec<(Arc<BundleSpecification>, NodeID)>,
        hold: ResourceHold,
        attempt: Arc<AttemptHandle>,
    ) -> Self {
        let mut node_batches: BTreeMap<NodeID, Vec<Arc<BundleSpecification>>> = BTreeMap::new();
        for (bundle, node_id) in selections {
            node_batches.entry(node_id).or_default().push(bundle);
        }
        Self {
            placement_group,
            phase: SchedulingPhase::Selecting,
            attempt,
            node_batches,
            prepared_nodes: Vec::new(),
            committed: HashMap::new(),
            uncommitted: Vec::new(),
            hold,
            stopwatch: Stopwatch::new(),
        }
    }

    /// A tracker for bundles whose prepare already succeeded on every node,
    /// e.g. a group found in the prepared state during recovery.
    pub fn new_prepared(
        placement_group: Arc<GcsPlacementGroup>,
        selections: Vec<(Arc<BundleSpecification>, NodeID)>,
        hold: ResourceHold,
        attempt: Arc<AttemptHandle>,
    ) -> Self {
        let mut tracker = Self::new(placement_group, selections, hold, attempt);
        tracker.prepared_nodes = tracker.node_batches.keys().copied().collect();
        tracker.phase = SchedulingPhase::Prepared;
        tracker
    }

    pub fn placement_group(&self) -> &Arc<GcsPlacementGroup> {
        &self.placement_group
    }

    pub fn phase(&self) -> SchedulingPhase {
        self.phase
    }

    pub fn set_phase(&mut self, next: SchedulingPhase) {
        debug_assert!(
            self.phase.can_move_to(next),
            "invalid scheduling phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(
            pg_id = ?self.placement_group.placement_group_id(),
            from = ?self.phase,
            to = ?next,
            "Scheduling phase transition"
        );
        self.phase = next;
    }

    pub fn is_cancelled(&self) -> bool {
        self.attempt.is_cancelled()
    }

    pub fn attempt(&self) -> &Arc<AttemptHandle> {
        &self.attempt
    }

    /// Selected nodes with the bundles each one receives.
    pub fn node_batches(&self) -> impl Iterator<Item = (&NodeID, &Vec<Arc<BundleSpecification>>)> {
        self.node_batches.iter()
    }

    pub fn bundles_on(&self, node_id: &NodeID) -> &[Arc<BundleSpecification>] {
        self.node_batches
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_batches.len()
    }

    pub fn mark_prepared(&mut self, node_id: NodeID) {
        if !self.prepared_nodes.contains(&node_id) {
            self.prepared_nodes.push(node_id);
        }
    }

    pub fn prepared_nodes(&self) -> &[NodeID] {
        &self.prepared_nodes
    }

    /// Record the node's bundles as committed and stop holding their
    /// resources. Returns the committed bundles.
    pub fn mark_committed(&mut self, node_id: NodeID) -> Vec<Arc<BundleSpecification>> {
        self.hold.take_node(&node_id);
        let bundles = self.bundles_on(&node_id).to_vec();
        for bundle in &bundles {
            self.committed
                .insert(bundle.bundle_id(), (node_id, Arc::clone(bundle)));
        }
        bundles
    }

    /// Record the node's bundles as not committed and return their hold.
    pub fn mark_uncommitted(&mut self, node_id: NodeID) {
        self.hold.release_node(&node_id);
        let ids: Vec<BundleID> = self.bundles_on(&node_id).iter().map(|b| b.bundle_id()).collect();
        self.uncommitted.extend(ids);
    }

    pub fn committed_locations(&self) -> &BundleLocations {
        &self.committed
    }

    pub fn uncommitted_bundles(&self) -> &[BundleID] {
        &self.uncommitted
    }

    /// Return everything still held to the cluster view.
    pub fn release_hold(&mut self) {
        self.hold.release_all();
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.stopwatch.elapsed_ms()
    }
}
