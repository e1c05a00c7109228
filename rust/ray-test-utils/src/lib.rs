// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for the placement-group scheduling crates.

pub mod generators;
pub mod wait;

pub use generators::{random_job_id, random_node_id, random_placement_group_id};
pub use wait::{wait_for_condition, wait_for_count};

/// Default timeout for the `wait_*` helpers, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 6000;

/// Initialize tracing for tests. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}
