// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! GCS Node Manager: the directory of alive cluster nodes.
//!
//! Membership is pushed in by whoever detects it (`add_node` / `remove_node`).
//! Removal is broadcast to listeners, which the placement group scheduler
//! uses to abort attempts that depend on the dead node.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use ray_common::id::NodeID;
use ray_common::scheduling::ResourceSet;

/// Liveness of a node as seen by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Dead,
}

/// What the directory knows about one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeID,
    pub resources_total: ResourceSet,
    pub state: NodeState,
}

impl NodeInfo {
    pub fn new(node_id: NodeID, resources_total: ResourceSet) -> Self {
        Self {
            node_id,
            resources_total,
            state: NodeState::Alive,
        }
    }
}

/// Callback invoked with the dead node's info after it leaves the alive set.
pub type NodeRemovedCallback = Box<dyn Fn(&NodeInfo) + Send + Sync>;

pub struct GcsNodeManager {
    alive_nodes: RwLock<HashMap<NodeID, Arc<NodeInfo>>>,
    node_removed_listeners: RwLock<Vec<NodeRemovedCallback>>,
}

impl GcsNodeManager {
    pub fn new() -> Self {
        Self {
            alive_nodes: RwLock::new(HashMap::new()),
            node_removed_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a node as alive.
    pub fn add_node(&self, mut node_info: NodeInfo) {
        let node_id = node_info.node_id;
        node_info.state = NodeState::Alive;
        self.alive_nodes.write().insert(node_id, Arc::new(node_info));
        tracing::info!(?node_id, "Node registered");
    }

    /// Drop a node from the alive set and notify listeners.
    /// Returns the dead node's info, or `None` if the node was not alive.
    pub fn remove_node(&self, node_id: &NodeID) -> Option<NodeInfo> {
        let node = self.alive_nodes.write().remove(node_id)?;

        let mut dead_node = (*node).clone();
        dead_node.state = NodeState::Dead;

        // The alive-set lock is released before listeners run, so they may
        // query the directory.
        let listeners = self.node_removed_listeners.read();
        for listener in listeners.iter() {
            listener(&dead_node);
        }

        tracing::info!(?node_id, "Node removed");
        Some(dead_node)
    }

    pub fn is_node_alive(&self, node_id: &NodeID) -> bool {
        self.alive_nodes.read().contains_key(node_id)
    }

    pub fn get_all_alive_nodes(&self) -> HashMap<NodeID, Arc<NodeInfo>> {
        self.alive_nodes.read().clone()
    }

    pub fn num_alive_nodes(&self) -> usize {
        self.alive_nodes.read().len()
    }

    pub fn add_node_removed_listener(&self, callback: NodeRemovedCallback) {
        self.node_removed_listeners.write().push(callback);
    }
}

impl Default for GcsNodeManager {
    fn default() -> Self {
        Self::new()
    }
}
