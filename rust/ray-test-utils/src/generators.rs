// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Random ID generators for tests.

use ray_common::id::{JobID, NodeID, PlacementGroupID};

/// Create a random non-nil JobID.
pub fn random_job_id() -> JobID {
    JobID::from_int(rand::random::<u16>() as u32 + 1)
}

/// Create a random NodeID.
pub fn random_node_id() -> NodeID {
    NodeID::from_random()
}

/// Create a random PlacementGroupID owned by a random job.
pub fn random_placement_group_id() -> PlacementGroupID {
    PlacementGroupID::of(&random_job_id())
}

/// NodeID whose first byte is `index` and the rest zero. Sorts by `index`.
pub fn indexed_node_id(index: u8) -> NodeID {
    let mut data = [0u8; NodeID::SIZE];
    data[0] = index;
    NodeID::from_binary(&data)
}
