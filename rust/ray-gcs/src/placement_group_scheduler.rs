// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! GCS Placement Group Scheduler: reserves bundles on nodes with a
//! prepare/commit protocol.
//!
//! Flow: select nodes and hold resources → PrepareBundleResources on every
//! selected node → CommitBundleResources on every prepared node → record the
//! committed locations and report success or failure.
//!
//! Each attempt runs as one spawned task that owns a [`LeaseStatusTracker`].
//! Scheduler bookkeeping lives behind one mutex that is never held across an
//! `.await` or while a caller's callback runs.
//!
//! A node removed from the directory while an attempt is waiting on prepare
//! or commit replies fails that phase at once; replies still outstanding are
//! abandoned and their nodes told to cancel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use ray_common::bundle_spec::{self, BundleSpecification};
use ray_common::config::ray_config;
use ray_common::id::{NodeID, PlacementGroupID};
use ray_common::scheduling::ResourceSet;
use ray_common::status::RayResult;
use tokio::task::JoinHandle;

use crate::bundle_location_index::BundleLocationIndex;
use crate::bundle_scheduling_policy::{
    BundleSchedulingOptions, BundleSchedulingResult, CompositeBundleSchedulingPolicy,
};
use crate::cluster_resource_manager::{ClusterResourceManager, NodeResources};
use crate::lease_status_tracker::{
    AttemptHandle, LeaseStatusTracker, ResourceHold, SchedulingPhase,
};
use crate::node_manager::GcsNodeManager;
use crate::placement_group::{GcsPlacementGroup, PlacementGroupState};
use crate::raylet_client::PlacementGroupRayletClient;

/// Called when an attempt fails. The flag is true when the group cannot be
/// placed on the current cluster at all.
pub type FailureCallback = Box<dyn FnOnce(Arc<GcsPlacementGroup>, bool) + Send>;
/// Called when every bundle of the attempt was committed.
pub type SuccessCallback = Box<dyn FnOnce(Arc<GcsPlacementGroup>) + Send>;

/// A group to drive through scheduling together with its callbacks.
pub struct SchedulePgRequest {
    pub placement_group: Arc<GcsPlacementGroup>,
    pub failure_callback: FailureCallback,
    pub success_callback: SuccessCallback,
}

/// Result of the selection step of an attempt.
pub enum ScheduleOutcome {
    NoAliveNodes,
    Infeasible,
    Failed,
    Success {
        selections: Vec<(Arc<BundleSpecification>, NodeID)>,
        hold: ResourceHold,
    },
}

#[derive(Default)]
struct SchedulerState {
    committed_bundle_location_index: BundleLocationIndex,
    /// Attempts currently running for each group, normally at most one.
    placement_group_leasing_in_progress: HashMap<PlacementGroupID, Vec<Arc<AttemptHandle>>>,
    /// Removed bundles whose resources were still in use. They stay in the
    /// location index until released.
    waiting_removed_bundles: Vec<(NodeID, Arc<BundleSpecification>)>,
}

/// The GCS placement group scheduler.
pub struct GcsPlacementGroupScheduler {
    node_manager: Arc<GcsNodeManager>,
    cluster_resource_manager: Arc<ClusterResourceManager>,
    raylet_client: Arc<dyn PlacementGroupRayletClient>,
    scheduling_policy: CompositeBundleSchedulingPolicy,
    state: Mutex<SchedulerState>,
}

impl GcsPlacementGroupScheduler {
    pub fn new(
        node_manager: Arc<GcsNodeManager>,
        cluster_resource_manager: Arc<ClusterResourceManager>,
        raylet_client: Arc<dyn PlacementGroupRayletClient>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            node_manager: Arc::clone(&node_manager),
            cluster_resource_manager,
            raylet_client,
            scheduling_policy: CompositeBundleSchedulingPolicy,
            state: Mutex::new(SchedulerState::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&scheduler);
        node_manager.add_node_removed_listener(Box::new(move |node| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_node_removed(&node.node_id);
            }
        }));

        scheduler
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Schedule the unplaced bundles of `placement_group`.
    ///
    /// Selection happens synchronously; when it fails `on_failure` runs
    /// before this returns and no RPC is sent. Otherwise the prepare/commit
    /// rounds run on a spawned task that eventually invokes exactly one of
    /// the callbacks.
    pub fn schedule_unplaced_bundles(
        self: &Arc<Self>,
        placement_group: Arc<GcsPlacementGroup>,
        on_failure: FailureCallback,
        on_success: SuccessCallback,
    ) {
        let pg_id = placement_group.placement_group_id();
        tracing::debug!(
            ?pg_id,
            strategy = %placement_group.strategy(),
            "Scheduling unplaced bundles of placement group"
        );

        let (selections, hold) = match self.select_bundles(&placement_group) {
            ScheduleOutcome::NoAliveNodes => {
                tracing::warn!(?pg_id, "No alive nodes to schedule placement group on");
                on_failure(placement_group, true);
                return;
            }
            ScheduleOutcome::Infeasible => {
                tracing::info!(?pg_id, "Placement group is infeasible on the current cluster");
                on_failure(placement_group, true);
                return;
            }
            ScheduleOutcome::Failed => {
                tracing::debug!(?pg_id, "Not enough available resources for placement group");
                on_failure(placement_group, false);
                return;
            }
            ScheduleOutcome::Success { selections, hold } => (selections, hold),
        };

        log_selections(&pg_id, &selections);
        let attempt = self.register_attempt(pg_id, &selections);
        let tracker = LeaseStatusTracker::new(placement_group, selections, hold, attempt);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.prepare_and_commit(tracker, on_failure, on_success).await;
        });
    }

    /// Pick a node for every unplaced bundle and hold the resources.
    fn select_bundles(&self, placement_group: &GcsPlacementGroup) -> ScheduleOutcome {
        let alive_nodes = self.node_manager.get_all_alive_nodes();
        if alive_nodes.is_empty() {
            return ScheduleOutcome::NoAliveNodes;
        }

        let bundles = placement_group.get_unplaced_bundles();
        let options = BundleSchedulingOptions {
            strategy: placement_group.strategy(),
            placed_nodes: placement_group.get_placed_nodes(),
        };

        // Serializes selection with other attempts so each sees the holds
        // taken before it.
        let _guard = self.state.lock();
        let view: HashMap<NodeID, NodeResources> = self
            .cluster_resource_manager
            .get_resource_view()
            .into_iter()
            .filter(|(node_id, _)| alive_nodes.contains_key(node_id))
            .collect();
        let requests: Vec<&ResourceSet> =
            bundles.iter().map(|b| b.get_required_resources()).collect();

        match self.scheduling_policy.schedule(&requests, &options, &view) {
            BundleSchedulingResult::Infeasible => ScheduleOutcome::Infeasible,
            BundleSchedulingResult::Failed => ScheduleOutcome::Failed,
            BundleSchedulingResult::Success(nodes) => {
                let selections: Vec<(Arc<BundleSpecification>, NodeID)> =
                    bundles.into_iter().zip(nodes).collect();
                let hold = ResourceHold::acquire(
                    Arc::clone(&self.cluster_resource_manager),
                    selections
                        .iter()
                        .map(|(bundle, node_id)| (*node_id, bundle.get_required_resources())),
                );
                match hold {
                    Some(hold) => ScheduleOutcome::Success { selections, hold },
                    None => ScheduleOutcome::Failed,
                }
            }
        }
    }

    async fn prepare_and_commit(
        self: Arc<Self>,
        mut tracker: LeaseStatusTracker,
        on_failure: FailureCallback,
        on_success: SuccessCallback,
    ) {
        tracker.set_phase(SchedulingPhase::Preparing);
        if !self.prepare_resources(&mut tracker).await {
            self.cancel_prepared_bundles(&tracker);
            self.fail_attempt(tracker, on_failure);
            return;
        }
        tracker.set_phase(SchedulingPhase::Prepared);
        tracker
            .placement_group()
            .update_state(PlacementGroupState::Prepared);
        self.commit_resources(tracker, on_failure, on_success).await;
    }

    /// Send one batched prepare per node and wait for all replies. Returns
    /// false if the attempt must be abandoned.
    async fn prepare_resources(&self, tracker: &mut LeaseStatusTracker) -> bool {
        let pg_id = tracker.placement_group().placement_group_id();
        if let Some(node_id) = self.find_dead_node(tracker.node_batches().map(|(n, _)| n)) {
            tracing::info!(?pg_id, ?node_id, "Selected node died before prepare");
            return false;
        }

        let attempt = Arc::clone(tracker.attempt());
        let client = &self.raylet_client;
        let mut outstanding: BTreeSet<NodeID> =
            tracker.node_batches().map(|(node_id, _)| *node_id).collect();
        let mut requests: FuturesUnordered<_> = tracker
            .node_batches()
            .map(|(node_id, bundles)| {
                let node_id = *node_id;
                let bundles = bundles.clone();
                async move {
                    let reply = client.prepare_bundle_resources(&node_id, bundles).await;
                    (node_id, reply)
                }
            })
            .collect();

        let mut all_prepared = true;
        loop {
            tokio::select! {
                next = requests.next() => {
                    let Some((node_id, reply)) = next else {
                        break;
                    };
                    outstanding.remove(&node_id);
                    all_prepared &= self.handle_prepare_reply(tracker, node_id, reply);
                }
                _ = attempt.node_removed() => {
                    let Some(dead) = self.find_dead_node(tracker.node_batches().map(|(n, _)| n))
                    else {
                        continue;
                    };
                    tracing::info!(
                        ?pg_id,
                        node_id = ?dead,
                        outstanding = outstanding.len(),
                        "Node died while preparing bundles"
                    );
                    drop(requests);
                    // The abandoned prepares may still land on alive nodes.
                    for node_id in outstanding {
                        if self.node_manager.is_node_alive(&node_id) {
                            let bundles = tracker.bundles_on(&node_id).to_vec();
                            self.cancel_resource_reserve(node_id, bundles);
                        }
                    }
                    return false;
                }
            }
        }

        if !all_prepared {
            return false;
        }
        if let Some(node_id) = self.find_dead_node(tracker.prepared_nodes()) {
            tracing::info!(?pg_id, ?node_id, "Prepared node died before commit");
            return false;
        }
        if tracker.is_cancelled() {
            tracing::info!(?pg_id, "Placement group scheduling cancelled while preparing");
            return false;
        }
        true
    }

    /// Record one prepare reply. Returns false if the node did not prepare.
    fn handle_prepare_reply(
        &self,
        tracker: &mut LeaseStatusTracker,
        node_id: NodeID,
        reply: RayResult<bool>,
    ) -> bool {
        let pg_id = tracker.placement_group().placement_group_id();
        match reply {
            Ok(true) if self.node_manager.is_node_alive(&node_id) => {
                tracker.mark_prepared(node_id);
                true
            }
            Ok(true) => {
                tracing::warn!(?pg_id, ?node_id, "Bundles prepared on a node that has since died");
                false
            }
            Ok(false) => {
                tracing::info!(?pg_id, ?node_id, "Node declined to prepare bundles");
                false
            }
            Err(e) => {
                tracing::warn!(
                    ?pg_id,
                    ?node_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Failed to prepare bundles"
                );
                false
            }
        }
    }

    /// Commit the prepared bundles and report the outcome.
    async fn commit_resources(
        self: Arc<Self>,
        mut tracker: LeaseStatusTracker,
        on_failure: FailureCallback,
        on_success: SuccessCallback,
    ) {
        let placement_group = Arc::clone(tracker.placement_group());
        let pg_id = placement_group.placement_group_id();

        if tracker.is_cancelled() {
            tracing::info!(?pg_id, "Placement group scheduling cancelled before commit");
            self.cancel_prepared_bundles(&tracker);
            self.fail_attempt(tracker, on_failure);
            return;
        }
        tracker.set_phase(SchedulingPhase::Committing);

        let mut to_commit = Vec::new();
        let mut skipped = Vec::new();
        for (node_id, _) in tracker.node_batches() {
            if tracker.prepared_nodes().contains(node_id)
                && self.node_manager.is_node_alive(node_id)
            {
                to_commit.push(*node_id);
            } else {
                skipped.push(*node_id);
            }
        }
        for node_id in skipped {
            tracker.mark_uncommitted(node_id);
        }

        let attempt = Arc::clone(tracker.attempt());
        let client = &self.raylet_client;
        let mut outstanding: BTreeSet<NodeID> = to_commit.iter().copied().collect();
        let mut requests: FuturesUnordered<_> = to_commit
            .iter()
            .map(|node_id| {
                let node_id = *node_id;
                let bundles = tracker.bundles_on(&node_id).to_vec();
                async move {
                    let reply = client.commit_bundle_resources(&node_id, bundles).await;
                    (node_id, reply)
                }
            })
            .collect();

        let mut replies = Vec::with_capacity(to_commit.len());
        loop {
            tokio::select! {
                next = requests.next() => {
                    let Some((node_id, reply)) = next else {
                        break;
                    };
                    outstanding.remove(&node_id);
                    replies.push((node_id, reply));
                }
                _ = attempt.node_removed() => {
                    // A node whose commit already returned is judged when
                    // its reply is processed.
                    if let Some(dead) = self.find_dead_node(&outstanding) {
                        tracing::info!(
                            ?pg_id,
                            node_id = ?dead,
                            outstanding = outstanding.len(),
                            "Node died while committing bundles"
                        );
                        break;
                    }
                }
            }
        }
        drop(requests);

        // Commits abandoned on alive nodes may still land there.
        for node_id in outstanding {
            if self.node_manager.is_node_alive(&node_id) {
                self.cancel_resource_reserve(node_id, tracker.bundles_on(&node_id).to_vec());
            }
            tracker.mark_uncommitted(node_id);
        }

        let cancelled = tracker.is_cancelled();
        for (node_id, reply) in replies {
            match reply {
                Ok(()) if self.node_manager.is_node_alive(&node_id) => {
                    self.record_committed_bundles(&mut tracker, node_id, !cancelled);
                }
                Ok(()) => {
                    tracing::warn!(?pg_id, ?node_id, "Bundles committed on a node that has since died");
                    tracker.mark_uncommitted(node_id);
                }
                Err(e) => {
                    tracing::warn!(
                        ?pg_id,
                        ?node_id,
                        error = %e,
                        transient = e.is_transient(),
                        "Failed to commit bundles"
                    );
                    tracker.mark_uncommitted(node_id);
                }
            }
        }

        if cancelled {
            tracing::info!(?pg_id, "Placement group scheduling cancelled while committing");
            self.destroy_placement_group_bundle_resources_if_exists(&pg_id);
            self.fail_attempt(tracker, on_failure);
            return;
        }

        if tracker.uncommitted_bundles().is_empty() && !placement_group.has_unplaced_bundles() {
            tracker.set_phase(SchedulingPhase::Succeeded);
            placement_group.update_state(PlacementGroupState::Created);
            self.finish_attempt(&tracker);
            tracing::info!(
                ?pg_id,
                elapsed_ms = tracker.elapsed_ms(),
                "Finished scheduling placement group"
            );
            on_success(placement_group);
        } else {
            tracing::info!(
                ?pg_id,
                uncommitted = tracker.uncommitted_bundles().len(),
                "Some bundles were not committed, placement group will be rescheduled"
            );
            placement_group.update_state(PlacementGroupState::Rescheduling);
            self.fail_attempt(tracker, on_failure);
        }
    }

    /// Index the node's committed bundles and publish their tagged resources.
    fn record_committed_bundles(
        &self,
        tracker: &mut LeaseStatusTracker,
        node_id: NodeID,
        assign_to_group: bool,
    ) {
        let placement_group = Arc::clone(tracker.placement_group());
        let pg_id = placement_group.placement_group_id();
        let bundles = tracker.mark_committed(node_id);

        let mut placed = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            self.cluster_resource_manager
                .add_bundle_resources(&node_id, &bundle.get_formatted_resources());
            if assign_to_group {
                placement_group.set_bundle_node(bundle.index(), node_id);
            }
            let mut spec = (*bundle).clone();
            spec.set_node_id(node_id);
            placed.push(Arc::new(spec));
        }

        let mut state = self.state.lock();
        for spec in placed {
            state.committed_bundle_location_index.add_bundle_location(
                pg_id,
                spec.bundle_id(),
                node_id,
                spec,
            );
        }
    }

    /// Send a batched cancel to every alive node that prepared this attempt.
    fn cancel_prepared_bundles(&self, tracker: &LeaseStatusTracker) {
        for node_id in tracker.prepared_nodes() {
            if self.node_manager.is_node_alive(node_id) {
                self.cancel_resource_reserve(*node_id, tracker.bundles_on(node_id).to_vec());
            }
        }
    }

    fn fail_attempt(&self, mut tracker: LeaseStatusTracker, on_failure: FailureCallback) {
        tracker.release_hold();
        tracker.set_phase(SchedulingPhase::Failed);
        self.finish_attempt(&tracker);
        on_failure(Arc::clone(tracker.placement_group()), false);
    }

    fn register_attempt(
        &self,
        pg_id: PlacementGroupID,
        selections: &[(Arc<BundleSpecification>, NodeID)],
    ) -> Arc<AttemptHandle> {
        let attempt = Arc::new(AttemptHandle::new(
            selections.iter().map(|(_, node_id)| *node_id),
        ));
        let mut state = self.state.lock();
        let attempts = state
            .placement_group_leasing_in_progress
            .entry(pg_id)
            .or_default();
        if !attempts.is_empty() {
            tracing::warn!(
                ?pg_id,
                running = attempts.len(),
                "Placement group is already being scheduled"
            );
        }
        attempts.push(Arc::clone(&attempt));
        attempt
    }

    fn finish_attempt(&self, tracker: &LeaseStatusTracker) {
        let pg_id = tracker.placement_group().placement_group_id();
        let mut state = self.state.lock();
        let Some(attempts) = state.placement_group_leasing_in_progress.get_mut(&pg_id) else {
            return;
        };
        attempts.retain(|attempt| !Arc::ptr_eq(attempt, tracker.attempt()));
        if attempts.is_empty() {
            state.placement_group_leasing_in_progress.remove(&pg_id);
        }
    }

    /// Flag every in-progress attempt of `pg_id` as cancelled. Each fails at
    /// its next checkpoint.
    pub fn mark_schedule_cancelled(&self, pg_id: &PlacementGroupID) {
        match self.state.lock().placement_group_leasing_in_progress.get(pg_id) {
            Some(attempts) => {
                for attempt in attempts {
                    attempt.cancel();
                }
                tracing::info!(
                    ?pg_id,
                    attempts = attempts.len(),
                    "Marked placement group scheduling as cancelled"
                );
            }
            None => {
                tracing::debug!(?pg_id, "No scheduling in progress to cancel");
            }
        }
    }

    pub fn is_scheduling_in_progress(&self, pg_id: &PlacementGroupID) -> bool {
        self.state
            .lock()
            .placement_group_leasing_in_progress
            .contains_key(pg_id)
    }

    /// First of `nodes` that the directory no longer lists as alive.
    fn find_dead_node<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeID>) -> Option<NodeID> {
        nodes
            .into_iter()
            .find(|node_id| !self.node_manager.is_node_alive(node_id))
            .copied()
    }

    // ─── Recovery ───────────────────────────────────────────────────────

    /// Rebuild scheduler state after a restart.
    ///
    /// `group_to_bundles` holds committed bundles with their nodes; they are
    /// indexed and their resources are re-applied without any RPC.
    /// `prepared_pgs` are groups whose bundles were prepared but not yet
    /// committed; they go straight to the commit round.
    pub fn initialize(
        self: &Arc<Self>,
        group_to_bundles: &HashMap<PlacementGroupID, Vec<Arc<BundleSpecification>>>,
        prepared_pgs: Vec<SchedulePgRequest>,
    ) {
        {
            let mut state = self.state.lock();
            for (pg_id, bundles) in group_to_bundles {
                for bundle in bundles {
                    let Some(node_id) = bundle.node_id() else {
                        tracing::warn!(?pg_id, bundle_index = bundle.index(), "Skipping unplaced bundle");
                        continue;
                    };
                    if !self.node_manager.is_node_alive(&node_id) {
                        tracing::info!(?pg_id, ?node_id, "Skipping bundle on a node that is not alive");
                        continue;
                    }
                    if !self
                        .cluster_resource_manager
                        .subtract_node_available_resources(&node_id, bundle.get_required_resources())
                    {
                        tracing::warn!(?pg_id, ?node_id, "Node lacks resources of a recovered bundle");
                    }
                    self.cluster_resource_manager
                        .add_bundle_resources(&node_id, &bundle.get_formatted_resources());
                    state.committed_bundle_location_index.add_bundle_location(
                        *pg_id,
                        bundle.bundle_id(),
                        node_id,
                        Arc::clone(bundle),
                    );
                }
            }
            tracing::info!(
                index = %state.committed_bundle_location_index.debug_string(),
                "Recovered committed bundle locations"
            );
        }

        for request in prepared_pgs {
            self.recommit_prepared(request);
        }
    }

    fn recommit_prepared(self: &Arc<Self>, request: SchedulePgRequest) {
        let SchedulePgRequest {
            placement_group,
            failure_callback,
            success_callback,
        } = request;
        let pg_id = placement_group.placement_group_id();

        let mut selections = Vec::new();
        for bundle in placement_group.get_bundles() {
            if let Some(node_id) = bundle.node_id() {
                placement_group.clear_bundle_node(bundle.index());
                if self.node_manager.is_node_alive(&node_id) {
                    selections.push((bundle, node_id));
                }
            }
        }

        let hold = ResourceHold::acquire(
            Arc::clone(&self.cluster_resource_manager),
            selections
                .iter()
                .map(|(bundle, node_id)| (*node_id, bundle.get_required_resources())),
        );
        let Some(hold) = hold else {
            tracing::warn!(?pg_id, "Cannot hold resources of a prepared placement group");
            for (bundle, node_id) in selections {
                self.cancel_resource_reserve(node_id, vec![bundle]);
            }
            failure_callback(placement_group, false);
            return;
        };

        tracing::info!(?pg_id, bundles = selections.len(), "Committing prepared placement group");
        let attempt = self.register_attempt(pg_id, &selections);
        let tracker = LeaseStatusTracker::new_prepared(placement_group, selections, hold, attempt);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.commit_resources(tracker, failure_callback, success_callback)
                .await;
        });
    }

    /// Tell every alive node which bundles it should keep. Nodes missing from
    /// `node_to_bundles` are told to keep none.
    pub async fn release_unused_bundles(
        &self,
        node_to_bundles: HashMap<NodeID, Vec<Arc<BundleSpecification>>>,
    ) {
        let mut nodes: Vec<NodeID> = self.node_manager.get_all_alive_nodes().into_keys().collect();
        nodes.sort();

        let client = &self.raylet_client;
        let requests: Vec<_> = nodes
            .into_iter()
            .map(|node_id| {
                let in_use = node_to_bundles.get(&node_id).cloned().unwrap_or_default();
                async move {
                    let reply = client.release_unused_bundles(&node_id, in_use).await;
                    (node_id, reply)
                }
            })
            .collect();

        for (node_id, reply) in join_all(requests).await {
            if let Err(e) = reply {
                tracing::warn!(?node_id, error = %e, "Failed to release unused bundles");
            }
        }
    }

    // ─── Index queries ──────────────────────────────────────────────────

    /// Forget every bundle committed on `node_id` and report them per group.
    pub fn get_and_remove_bundles_on_node(
        &self,
        node_id: &NodeID,
    ) -> HashMap<PlacementGroupID, Vec<i64>> {
        let removed = self
            .state
            .lock()
            .committed_bundle_location_index
            .get_and_remove_bundles_on_node(node_id);
        tracing::debug!(?node_id, groups = removed.len(), "Removed bundles on node");
        removed
    }

    /// Nodes and bundle indexes of the committed bundles of `pg_id`, sorted
    /// by bundle index.
    pub fn get_bundle_locations(&self, pg_id: &PlacementGroupID) -> Vec<(i64, NodeID)> {
        let state = self.state.lock();
        let mut locations: Vec<(i64, NodeID)> = state
            .committed_bundle_location_index
            .get_bundle_locations(pg_id)
            .map(|locations| {
                locations
                    .iter()
                    .map(|(bundle_id, (node_id, _))| (bundle_id.1, *node_id))
                    .collect()
            })
            .unwrap_or_default();
        locations.sort();
        locations
    }

    // ─── Destruction ────────────────────────────────────────────────────

    /// Release every committed bundle of `pg_id`. Bundles whose resources are
    /// still in use are parked until [`Self::handle_waiting_removed_bundles`]
    /// finds them free and stay indexed until then. Parked bundles are
    /// skipped on repeated calls. A group with no committed bundles is
    /// ignored.
    pub fn destroy_placement_group_bundle_resources_if_exists(&self, pg_id: &PlacementGroupID) {
        let (to_release, deferred) = {
            let mut state = self.state.lock();
            let Some(locations) = state
                .committed_bundle_location_index
                .get_bundle_locations(pg_id)
                .cloned()
            else {
                return;
            };

            let mut to_release = Vec::with_capacity(locations.len());
            let mut deferred = 0;
            let mut still_indexed = 0;
            for (bundle_id, (node_id, bundle)) in locations {
                let already_waiting = state
                    .waiting_removed_bundles
                    .iter()
                    .any(|(_, waiting)| waiting.bundle_id() == bundle_id);
                if already_waiting {
                    still_indexed += 1;
                    continue;
                }
                if self
                    .cluster_resource_manager
                    .is_resource_in_use(&node_id, &bundle.get_formatted_resources())
                {
                    tracing::debug!(
                        ?pg_id,
                        ?node_id,
                        bundle_index = bundle.index(),
                        "Bundle resources still in use, deferring removal"
                    );
                    state.waiting_removed_bundles.push((node_id, bundle));
                    deferred += 1;
                    still_indexed += 1;
                } else {
                    to_release.push((node_id, bundle));
                }
            }

            let index = &mut state.committed_bundle_location_index;
            if still_indexed == 0 {
                index.erase_placement_group(pg_id);
            } else {
                for (_, bundle) in &to_release {
                    index.remove_bundle_location(&bundle.bundle_id());
                }
            }
            (to_release, deferred)
        };

        if to_release.is_empty() && deferred == 0 {
            return;
        }
        tracing::info!(
            ?pg_id,
            released = to_release.len(),
            deferred,
            "Destroying placement group bundles"
        );
        for (node_id, bundle) in to_release {
            self.release_bundle(node_id, bundle);
        }
    }

    /// Release the deferred removals whose resources are no longer in use.
    pub fn handle_waiting_removed_bundles(&self) {
        let ready = {
            let mut state = self.state.lock();
            let waiting = std::mem::take(&mut state.waiting_removed_bundles);
            let (ready, still_waiting): (Vec<_>, Vec<_>) =
                waiting.into_iter().partition(|(node_id, bundle)| {
                    !self
                        .cluster_resource_manager
                        .is_resource_in_use(node_id, &bundle.get_formatted_resources())
                });
            state.waiting_removed_bundles = still_waiting;
            for (_, bundle) in &ready {
                state
                    .committed_bundle_location_index
                    .remove_bundle_location(&bundle.bundle_id());
            }
            ready
        };

        if !ready.is_empty() {
            tracing::debug!(count = ready.len(), "Releasing bundles that are no longer in use");
        }
        for (node_id, bundle) in ready {
            self.release_bundle(node_id, bundle);
        }
    }

    pub fn get_waiting_removed_bundles_size(&self) -> usize {
        self.state.lock().waiting_removed_bundles.len()
    }

    pub fn is_placement_group_wildcard_resource(&self, resource_name: &str) -> bool {
        bundle_spec::is_placement_group_wildcard_resource(resource_name)
    }

    /// Periodically retry deferred removals, at the configured period.
    pub fn start_waiting_removed_bundles_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let period_ms = ray_config().gcs_placement_group_waiting_removed_bundles_period_ms;
        self.start_waiting_removed_bundles_loop_with_period(Duration::from_millis(period_ms.max(1)))
    }

    /// Periodically retry deferred removals. The loop stops once the
    /// scheduler is dropped.
    pub fn start_waiting_removed_bundles_loop_with_period(
        self: &Arc<Self>,
        period: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.handle_waiting_removed_bundles();
            }
            tracing::debug!("Waiting-removed bundles loop stopped");
        })
    }

    fn release_bundle(&self, node_id: NodeID, bundle: Arc<BundleSpecification>) {
        let formatted = bundle.get_formatted_resources();
        let required = bundle.get_required_resources().clone();
        if self.node_manager.is_node_alive(&node_id) {
            self.cancel_resource_reserve(node_id, vec![bundle]);
        }
        self.cluster_resource_manager
            .remove_bundle_resources(&node_id, &formatted);
        self.cluster_resource_manager
            .add_node_available_resources(&node_id, &required);
    }

    fn on_node_removed(&self, node_id: &NodeID) {
        let mut state = self.state.lock();
        let woken = state
            .placement_group_leasing_in_progress
            .values()
            .flatten()
            .filter(|attempt| attempt.notify_node_removed(node_id))
            .count();
        if woken > 0 {
            tracing::info!(?node_id, attempts = woken, "Node removed under in-flight attempts");
        }

        let before = state.waiting_removed_bundles.len();
        state
            .waiting_removed_bundles
            .retain(|(waiting_node, _)| waiting_node != node_id);
        let dropped = before - state.waiting_removed_bundles.len();
        if dropped > 0 {
            tracing::info!(?node_id, dropped, "Dropped waiting-removed bundles of a dead node");
        }
    }

    /// Fire-and-forget cancel of `bundles` on `node_id`.
    fn cancel_resource_reserve(&self, node_id: NodeID, bundles: Vec<Arc<BundleSpecification>>) {
        let client = Arc::clone(&self.raylet_client);
        tokio::spawn(async move {
            if let Err(e) = client.cancel_resource_reserve(&node_id, bundles).await {
                tracing::warn!(?node_id, error = %e, "Failed to cancel bundle reservation");
            }
        });
    }

    pub fn debug_string(&self) -> String {
        let max_entries = ray_config().gcs_placement_group_debug_dump_max_entries as usize;
        let state = self.state.lock();
        let mut in_progress: Vec<String> = state
            .placement_group_leasing_in_progress
            .keys()
            .map(|pg_id| pg_id.hex())
            .collect();
        in_progress.sort();
        in_progress.truncate(max_entries);
        format!(
            "GcsPlacementGroupScheduler: {{in progress: [{}], waiting removed bundles: {}, {}}}",
            in_progress.join(", "),
            state.waiting_removed_bundles.len(),
            state.committed_bundle_location_index.debug_string()
        )
    }
}

fn log_selections(pg_id: &PlacementGroupID, selections: &[(Arc<BundleSpecification>, NodeID)]) {
    let detailed = ray_config().gcs_placement_group_log_scheduling_details;
    for (bundle, node_id) in selections {
        if detailed {
            tracing::info!(?pg_id, bundle_index = bundle.index(), ?node_id, "Bundle selected node");
        } else {
            tracing::debug!(?pg_id, bundle_index = bundle.index(), ?node_id, "Bundle selected node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_manager::NodeInfo;
    use crate::placement_group::PlacementStrategy;
    use ray_common::id::JobID;
    use ray_common::scheduling::FixedPoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts every request immediately.
    #[derive(Default)]
    struct AcceptingRayletClient {
        prepares: AtomicUsize,
        commits: AtomicUsize,
        cancels: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PlacementGroupRayletClient for AcceptingRayletClient {
        async fn prepare_bundle_resources(
            &self,
            _node_id: &NodeID,
            _bundles: Vec<Arc<BundleSpecification>>,
        ) -> RayResult<bool> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn commit_bundle_resources(
            &self,
            _node_id: &NodeID,
            _bundles: Vec<Arc<BundleSpecification>>,
        ) -> RayResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel_resource_reserve(
            &self,
            _node_id: &NodeID,
            bundles: Vec<Arc<BundleSpecification>>,
        ) -> RayResult<()> {
            self.cancels.fetch_add(bundles.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn release_unused_bundles(
            &self,
            _node_id: &NodeID,
            _bundles_in_use: Vec<Arc<BundleSpecification>>,
        ) -> RayResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        node_manager: Arc<GcsNodeManager>,
        resources: Arc<ClusterResourceManager>,
        client: Arc<AcceptingRayletClient>,
        scheduler: Arc<GcsPlacementGroupScheduler>,
    }

    impl Harness {
        fn new() -> Self {
            let node_manager = Arc::new(GcsNodeManager::new());
            let resources = Arc::new(ClusterResourceManager::new());
            let client = Arc::new(AcceptingRayletClient::default());
            let scheduler = GcsPlacementGroupScheduler::new(
                Arc::clone(&node_manager),
                Arc::clone(&resources),
                Arc::clone(&client) as Arc<dyn PlacementGroupRayletClient>,
            );
            Self {
                node_manager,
                resources,
                client,
                scheduler,
            }
        }

        fn add_node(&self, v: u8, cpus: f64) -> NodeID {
            let mut data = [0u8; 28];
            data[0] = v;
            let node_id = NodeID::from_binary(&data);
            let total = ResourceSet::from_pairs([("CPU", cpus)]);
            self.resources.add_or_update_node(node_id, total.clone());
            self.node_manager.add_node(NodeInfo::new(node_id, total));
            node_id
        }

        fn available_cpu(&self, node_id: &NodeID) -> f64 {
            self.resources
                .get_available(node_id)
                .map(|r| r.get("CPU"))
                .unwrap_or(FixedPoint::ZERO)
                .to_f64()
        }

        /// Schedule and wait for the attempt to finish. Returns
        /// `Ok(())` on success and `Err(infeasible)` on failure.
        async fn schedule(&self, pg: &Arc<GcsPlacementGroup>) -> Result<(), bool> {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = Arc::new(Mutex::new(Some(tx)));
            let tx_fail = Arc::clone(&tx);
            self.scheduler.schedule_unplaced_bundles(
                Arc::clone(pg),
                Box::new(move |_, infeasible| {
                    if let Some(tx) = tx_fail.lock().take() {
                        let _ = tx.send(Err(infeasible));
                    }
                }),
                Box::new(move |_| {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(Ok(()));
                    }
                }),
            );
            rx.await.unwrap()
        }
    }

    fn make_group(strategy: PlacementStrategy, cpus: &[f64]) -> Arc<GcsPlacementGroup> {
        Arc::new(GcsPlacementGroup::new(
            PlacementGroupID::of(&JobID::from_int(1)),
            "test",
            strategy,
            cpus.iter()
                .map(|c| ResourceSet::from_pairs([("CPU", *c)]))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_schedule_commits_and_indexes_bundles() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0, 1.0]);

        assert_eq!(h.schedule(&pg).await, Ok(()));
        assert_eq!(pg.state(), PlacementGroupState::Created);
        assert!(!pg.has_unplaced_bundles());
        assert_eq!(h.client.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.commits.load(Ordering::SeqCst), 1);
        assert_eq!(h.available_cpu(&node), 2.0);
        assert_eq!(
            h.scheduler.get_bundle_locations(&pg.placement_group_id()),
            vec![(0, node), (1, node)]
        );
        assert!(!h.scheduler.is_scheduling_in_progress(&pg.placement_group_id()));

        let wildcard = bundle_spec::format_placement_group_resource(
            "CPU",
            &pg.placement_group_id(),
            None,
        );
        assert_eq!(
            h.resources.get_total(&node).unwrap().get(&wildcard).to_f64(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_infeasible_group_sends_no_rpc() {
        let h = Harness::new();
        h.add_node(0, 2.0);
        let pg = make_group(PlacementStrategy::StrictPack, &[2.0, 1.0]);

        assert_eq!(h.schedule(&pg).await, Err(true));
        assert_eq!(h.client.prepares.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_returns_resources_once() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Spread, &[1.0, 1.0]);
        h.schedule(&pg).await.unwrap();

        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg.placement_group_id());
        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg.placement_group_id());
        ray_test_utils::wait::settle().await;

        assert_eq!(h.client.cancels.load(Ordering::SeqCst), 2);
        assert_eq!(h.available_cpu(&node), 4.0);
        assert_eq!(h.resources.get_total(&node).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_destroy_skips_deferred_bundles() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0, 1.0]);
        let pg_id = pg.placement_group_id();
        h.schedule(&pg).await.unwrap();

        // Only bundle 0 is busy.
        let busy = ResourceSet::from_pairs([(
            bundle_spec::format_placement_group_resource("CPU", &pg_id, Some(0)).as_str(),
            0.5,
        )]);
        assert!(h.resources.subtract_node_available_resources(&node, &busy));

        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg_id);
        ray_test_utils::wait::settle().await;
        assert_eq!(h.client.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 1);
        assert_eq!(h.scheduler.get_bundle_locations(&pg_id), vec![(0, node)]);

        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg_id);
        ray_test_utils::wait::settle().await;
        assert_eq!(h.client.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 1);

        h.resources.add_node_available_resources(&node, &busy);
        h.scheduler.handle_waiting_removed_bundles();
        ray_test_utils::wait::settle().await;
        assert_eq!(h.client.cancels.load(Ordering::SeqCst), 2);
        assert!(h.scheduler.get_bundle_locations(&pg_id).is_empty());
        assert_eq!(h.available_cpu(&node), 4.0);
    }

    #[tokio::test]
    async fn test_waiting_removed_bundles_dropped_with_node() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0]);
        h.schedule(&pg).await.unwrap();

        let formatted = pg.get_bundles()[0].get_formatted_resources();
        assert!(h.resources.subtract_node_available_resources(&node, &formatted));
        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg.placement_group_id());
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 1);

        h.node_manager.remove_node(&node);
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 0);
    }

    #[tokio::test]
    async fn test_waiting_removed_bundles_loop_releases_freed_bundles() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0]);
        h.schedule(&pg).await.unwrap();

        let formatted = pg.get_bundles()[0].get_formatted_resources();
        assert!(h.resources.subtract_node_available_resources(&node, &formatted));
        h.scheduler
            .destroy_placement_group_bundle_resources_if_exists(&pg.placement_group_id());
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 1);

        let handle = h
            .scheduler
            .start_waiting_removed_bundles_loop_with_period(Duration::from_millis(20));
        ray_test_utils::wait::settle().await;
        assert_eq!(h.scheduler.get_waiting_removed_bundles_size(), 1);

        h.resources.add_node_available_resources(&node, &formatted);
        let scheduler = Arc::clone(&h.scheduler);
        assert!(
            ray_test_utils::wait_for_condition(
                move || scheduler.get_waiting_removed_bundles_size() == 0,
                ray_test_utils::DEFAULT_WAIT_TIMEOUT_MS,
            )
            .await
        );
        assert_eq!(h.available_cpu(&node), 4.0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_release_unused_bundles_reaches_every_alive_node() {
        let h = Harness::new();
        let node0 = h.add_node(0, 4.0);
        h.add_node(1, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0]);

        let mut in_use = HashMap::new();
        in_use.insert(node0, pg.get_bundles());
        h.scheduler.release_unused_bundles(in_use).await;
        assert_eq!(h.client.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_initialize_reapplies_resources() {
        let h = Harness::new();
        let node = h.add_node(0, 4.0);
        let pg = make_group(PlacementStrategy::Pack, &[1.0, 2.0]);
        let bundles: Vec<Arc<BundleSpecification>> = pg
            .get_bundles()
            .into_iter()
            .map(|b| {
                let mut spec = (*b).clone();
                spec.set_node_id(node);
                Arc::new(spec)
            })
            .collect();
        let mut group_to_bundles = HashMap::new();
        group_to_bundles.insert(pg.placement_group_id(), bundles);

        h.scheduler.initialize(&group_to_bundles, Vec::new());

        assert_eq!(h.available_cpu(&node), 1.0);
        assert_eq!(
            h.scheduler.get_bundle_locations(&pg.placement_group_id()),
            vec![(0, node), (1, node)]
        );
        assert_eq!(h.client.prepares.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_cancelled_without_attempt_is_noop() {
        let h = Harness::new();
        let pg_id = PlacementGroupID::of(&JobID::from_int(2));
        h.scheduler.mark_schedule_cancelled(&pg_id);
        assert!(!h.scheduler.is_scheduling_in_progress(&pg_id));
        assert!(h.scheduler.debug_string().contains("waiting removed bundles: 0"));
        assert!(h.scheduler.is_placement_group_wildcard_resource(
            &bundle_spec::format_placement_group_resource("CPU", &pg_id, None)
        ));
    }
}
