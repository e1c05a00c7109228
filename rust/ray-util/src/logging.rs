// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup for Ray components using the `tracing` ecosystem.

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Environment variable consulted first for the log filter.
pub const LOG_LEVEL_ENV: &str = "RAY_BACKEND_LOG_LEVEL";

/// Build the filter used by [`init_ray_logging`].
///
/// `RAY_BACKEND_LOG_LEVEL` wins over `RUST_LOG`; when neither is set the
/// verbosity picks the level (0 = info, 1 = debug, anything higher = trace).
pub fn log_filter(verbosity: i32) -> EnvFilter {
    EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)))
}

fn level_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize logging for a Ray component.
///
/// Lines go to `<log_dir>/<component>.log` when a directory is given and to
/// stderr otherwise. Calling this twice is harmless: the second subscriber
/// is rejected and the first one stays installed.
pub fn init_ray_logging(
    component: &str,
    log_dir: Option<&Path>,
    verbosity: i32,
) -> std::io::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbosity))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if let Some(dir) = log_dir {
        let log_file = dir.join(format!("{component}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        subscriber.with_writer(file).try_init().is_ok()
    } else {
        subscriber.try_init().is_ok()
    };

    if installed {
        tracing::info!(component, "Ray logging initialized");
    }
    Ok(())
}
