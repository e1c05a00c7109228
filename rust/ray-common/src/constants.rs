// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared by the scheduling crates.

/// Length of Ray full-length UniqueIDs in bytes.
pub const UNIQUE_ID_SIZE: usize = 28;

/// Precision of fractional resource quantity.
pub const RESOURCE_UNIT_SCALING: i32 = 10000;

/// Separator between a resource name and the placement group it is tagged with.
pub const PLACEMENT_GROUP_RESOURCE_INFIX: &str = "_group_";

/// Synthetic resource every committed bundle carries, so an empty bundle is
/// still addressable.
pub const BUNDLE_RESOURCE_LABEL: &str = "bundle";

/// Amount of the synthetic `bundle` resource reserved per bundle.
pub const BUNDLE_RESOURCE_AMOUNT: f64 = 1000.0;

/// Name of the CPU resource.
pub const CPU_RESOURCE_LABEL: &str = "CPU";
