// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Bundle scheduling policies: choose a node for every bundle of a group.
//!
//! Policies are pure functions of the resource view they are handed. Each one
//! is first run against node totals (can this ever fit?) and then against
//! current availability (does it fit now?), which separates `Infeasible` from
//! `Failed`.
//!
//! Nodes are visited in `NodeID` order and ties keep the first candidate, so a
//! given view always produces the same placement.

use std::collections::HashMap;

use ray_common::id::NodeID;
use ray_common::scheduling::ResourceSet;

use crate::cluster_resource_manager::NodeResources;
use crate::placement_group::PlacementStrategy;

/// Inputs to a bundle policy besides the requests and the resource view.
#[derive(Debug, Clone)]
pub struct BundleSchedulingOptions {
    pub strategy: PlacementStrategy,
    /// Nodes already hosting committed bundles of the same group.
    pub placed_nodes: Vec<NodeID>,
}

impl BundleSchedulingOptions {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self {
            strategy,
            placed_nodes: Vec::new(),
        }
    }
}

/// Trait for bundle (placement group) scheduling policies.
pub trait BundleSchedulingPolicy: Send + Sync {
    /// Schedule a set of bundles. Returns node IDs (one per bundle) on success.
    fn schedule(
        &self,
        requests: &[&ResourceSet],
        options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult;
}

/// Result of bundle scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSchedulingResult {
    Success(Vec<NodeID>),
    /// Could fit on the cluster, but not with what is available right now.
    Failed,
    /// Could not fit even on empty nodes.
    Infeasible,
}

/// A mutable copy of one resource vector per node, sorted by node ID.
type Candidates = Vec<(NodeID, ResourceSet)>;

fn candidates(
    nodes: &HashMap<NodeID, NodeResources>,
    pick: fn(&NodeResources) -> &ResourceSet,
) -> Candidates {
    let mut view: Candidates = nodes
        .iter()
        .map(|(id, resources)| (*id, pick(resources).clone()))
        .collect();
    view.sort_by(|a, b| a.0.cmp(&b.0));
    view
}

/// Run `place` against totals, then against availability.
fn classify<F>(
    requests: &[&ResourceSet],
    nodes: &HashMap<NodeID, NodeResources>,
    place: F,
) -> BundleSchedulingResult
where
    F: Fn(&[&ResourceSet], Candidates) -> Option<Vec<NodeID>>,
{
    if requests.is_empty() {
        return BundleSchedulingResult::Success(vec![]);
    }
    if place(requests, candidates(nodes, |n| &n.total)).is_none() {
        return BundleSchedulingResult::Infeasible;
    }
    match place(requests, candidates(nodes, |n| &n.available)) {
        Some(assignments) => BundleSchedulingResult::Success(assignments),
        None => BundleSchedulingResult::Failed,
    }
}

#[derive(Clone, Copy)]
enum Prefer {
    MostRemaining,
    LeastRemaining,
}

/// Index of the best candidate that fits `request` and passes `eligible`.
fn best_candidate(
    view: &Candidates,
    request: &ResourceSet,
    eligible: impl Fn(usize, &NodeID) -> bool,
    prefer: Prefer,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, (node_id, available)) in view.iter().enumerate() {
        if !eligible(index, node_id) || !available.is_superset_of(request) {
            continue;
        }
        let score = remaining_score(available, request);
        let better = match (best, prefer) {
            (None, _) => true,
            (Some((_, best_score)), Prefer::MostRemaining) => score > best_score,
            (Some((_, best_score)), Prefer::LeastRemaining) => score < best_score,
        };
        if better {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

// ─── Pack ───────────────────────────────────────────────────────────────────

/// Soft pack: try to pack bundles onto few nodes.
pub struct BundlePackSchedulingPolicy;

impl BundlePackSchedulingPolicy {
    fn place(requests: &[&ResourceSet], mut view: Candidates) -> Option<Vec<NodeID>> {
        let mut used: Vec<usize> = Vec::new();
        let mut assignments = Vec::with_capacity(requests.len());
        for req in requests {
            // Keep filling nodes this group already uses, tightest first.
            let index = best_candidate(&view, req, |i, _| used.contains(&i), Prefer::LeastRemaining)
                .or_else(|| best_candidate(&view, req, |_, _| true, Prefer::MostRemaining))?;
            view[index].1.subtract(req);
            if !used.contains(&index) {
                used.push(index);
            }
            assignments.push(view[index].0);
        }
        Some(assignments)
    }
}

impl BundleSchedulingPolicy for BundlePackSchedulingPolicy {
    fn schedule(
        &self,
        requests: &[&ResourceSet],
        _options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult {
        classify(requests, nodes, Self::place)
    }
}

// ─── Spread ─────────────────────────────────────────────────────────────────

/// Soft spread: try to spread bundles across different nodes.
pub struct BundleSpreadSchedulingPolicy;

impl BundleSpreadSchedulingPolicy {
    fn place(requests: &[&ResourceSet], mut view: Candidates) -> Option<Vec<NodeID>> {
        let mut used: Vec<usize> = Vec::new();
        let mut assignments = Vec::with_capacity(requests.len());
        for req in requests {
            // Prefer unused nodes first, fall back to already-used ones.
            let index = best_candidate(&view, req, |i, _| !used.contains(&i), Prefer::MostRemaining)
                .or_else(|| best_candidate(&view, req, |_, _| true, Prefer::MostRemaining))?;
            view[index].1.subtract(req);
            if !used.contains(&index) {
                used.push(index);
            }
            assignments.push(view[index].0);
        }
        Some(assignments)
    }
}

impl BundleSchedulingPolicy for BundleSpreadSchedulingPolicy {
    fn schedule(
        &self,
        requests: &[&ResourceSet],
        _options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult {
        classify(requests, nodes, Self::place)
    }
}

// ─── Strict pack ────────────────────────────────────────────────────────────

/// Strict pack: all bundles on one node.
///
/// Picks the node with the most capacity left after taking the whole group.
/// When part of the group is already placed, only that node qualifies.
pub struct BundleStrictPackSchedulingPolicy;

impl BundleSchedulingPolicy for BundleStrictPackSchedulingPolicy {
    fn schedule(
        &self,
        requests: &[&ResourceSet],
        options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult {
        let mut total_request = ResourceSet::new();
        for req in requests {
            total_request.add(req);
        }
        let placed = &options.placed_nodes;
        classify(requests, nodes, |requests, view| {
            let index = best_candidate(
                &view,
                &total_request,
                |_, node_id| placed.is_empty() || placed.contains(node_id),
                Prefer::MostRemaining,
            )?;
            Some(vec![view[index].0; requests.len()])
        })
    }
}

// ─── Strict spread ──────────────────────────────────────────────────────────

/// Strict spread: each bundle on a different node, never on a node that
/// already hosts a bundle of the same group.
///
/// Bundles are matched to nodes with augmenting paths, so a bundle that fits
/// only one node does not lose it to a bundle that would fit elsewhere.
pub struct BundleStrictSpreadSchedulingPolicy;

impl BundleStrictSpreadSchedulingPolicy {
    fn place(
        requests: &[&ResourceSet],
        view: Candidates,
        placed: &[NodeID],
    ) -> Option<Vec<NodeID>> {
        let eligible: Vec<usize> = (0..view.len())
            .filter(|&i| !placed.contains(&view[i].0))
            .collect();
        if eligible.len() < requests.len() {
            return None;
        }

        // Per bundle, the nodes it fits on, roomiest first.
        let preferences: Vec<Vec<usize>> = requests
            .iter()
            .map(|req| {
                let mut fits: Vec<(usize, f64)> = eligible
                    .iter()
                    .copied()
                    .filter(|&i| view[i].1.is_superset_of(req))
                    .map(|i| (i, remaining_score(&view[i].1, req)))
                    .collect();
                fits.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.0.cmp(&b.0))
                });
                fits.into_iter().map(|(i, _)| i).collect()
            })
            .collect();

        let mut node_owner: Vec<Option<usize>> = vec![None; view.len()];
        for bundle in 0..requests.len() {
            let mut visited = vec![false; view.len()];
            if !augment(bundle, &preferences, &mut node_owner, &mut visited) {
                return None;
            }
        }

        let mut assignments = vec![None; requests.len()];
        for (node_index, owner) in node_owner.iter().enumerate() {
            if let Some(bundle) = owner {
                assignments[*bundle] = Some(view[node_index].0);
            }
        }
        assignments.into_iter().collect()
    }
}

/// Try to give `bundle` a node, re-seating earlier bundles if needed.
fn augment(
    bundle: usize,
    preferences: &[Vec<usize>],
    node_owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &node in &preferences[bundle] {
        if visited[node] {
            continue;
        }
        visited[node] = true;
        let free = match node_owner[node] {
            None => true,
            Some(other) => augment(other, preferences, node_owner, visited),
        };
        if free {
            node_owner[node] = Some(bundle);
            return true;
        }
    }
    false
}

impl BundleSchedulingPolicy for BundleStrictSpreadSchedulingPolicy {
    fn schedule(
        &self,
        requests: &[&ResourceSet],
        options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult {
        classify(requests, nodes, |requests, view| {
            Self::place(requests, view, &options.placed_nodes)
        })
    }
}

// ─── Composite ──────────────────────────────────────────────────────────────

/// Routes to the correct bundle scheduling policy.
pub struct CompositeBundleSchedulingPolicy;

impl CompositeBundleSchedulingPolicy {
    pub fn schedule(
        &self,
        requests: &[&ResourceSet],
        options: &BundleSchedulingOptions,
        nodes: &HashMap<NodeID, NodeResources>,
    ) -> BundleSchedulingResult {
        match options.strategy {
            PlacementStrategy::Pack => BundlePackSchedulingPolicy.schedule(requests, options, nodes),
            PlacementStrategy::Spread => {
                BundleSpreadSchedulingPolicy.schedule(requests, options, nodes)
            }
            PlacementStrategy::StrictPack => {
                BundleStrictPackSchedulingPolicy.schedule(requests, options, nodes)
            }
            PlacementStrategy::StrictSpread => {
                BundleStrictSpreadSchedulingPolicy.schedule(requests, options, nodes)
            }
        }
    }
}

/// Score a node by remaining capacity after allocation (higher = more remaining = preferred).
fn remaining_score(available: &ResourceSet, request: &ResourceSet) -> f64 {
    let mut min_remaining = f64::MAX;
    for (name, req_amount) in request.iter() {
        let avail = available.get(name);
        let remaining = (avail - req_amount).to_f64();
        min_remaining = min_remaining.min(remaining);
    }
    if min_remaining == f64::MAX {
        0.0
    } else {
        min_remaining
    }
}
