// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Polling helpers for tests that drive spawned tasks.
//!
//! All helpers sleep on the tokio clock between polls, so tasks spawned on a
//! current-thread runtime make progress while the test waits.

use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll a synchronous condition until it returns true or `timeout_ms` elapses.
///
/// Returns `true` if the condition was met, `false` on timeout.
pub async fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until `count()` equals `expected`.
pub async fn wait_for_count<F>(count: F, expected: usize, timeout_ms: u64) -> bool
where
    F: Fn() -> usize,
{
    wait_for_condition(|| count() == expected, timeout_ms).await
}

/// Give spawned tasks a chance to run without waiting for anything in
/// particular. Used to assert that something did *not* happen.
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(POLL_INTERVAL * 5).await;
}
