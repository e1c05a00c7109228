// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ray configuration.
//!
//! A plain struct with defaults that supports:
//! - Base64-encoded JSON config string from the launcher
//! - Plain JSON config strings
//! - Environment variable overrides: `RAY_<field_name>`

use std::sync::OnceLock;

/// Global Ray configuration singleton.
static RAY_CONFIG: OnceLock<RayConfig> = OnceLock::new();

/// Get the global RayConfig, falling back to defaults (plus environment
/// overrides) if nothing was installed via [`initialize_config`].
pub fn ray_config() -> &'static RayConfig {
    RAY_CONFIG.get_or_init(|| {
        let mut config = RayConfig::default();
        config.apply_env_overrides();
        config
    })
}

/// Initialize the global RayConfig from a base64-encoded JSON string.
/// Returns an error if already initialized.
pub fn initialize_config(config_str: Option<&str>) -> Result<(), String> {
    let config = match config_str {
        Some(s) if !s.is_empty() => RayConfig::from_base64_json(s)?,
        _ => {
            let mut config = RayConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    RAY_CONFIG
        .set(config)
        .map_err(|_| "RayConfig already initialized".to_string())
}

/// Ray configuration parameters for placement-group scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct RayConfig {
    // ─── Placement groups ─────────────────────────────────────
    /// Period of the tick that retries bundles whose removal was deferred
    /// because their resources were still in use.
    pub gcs_placement_group_waiting_removed_bundles_period_ms: u64,
    /// Log every bundle → node assignment at info level instead of debug.
    pub gcs_placement_group_log_scheduling_details: bool,
    /// Maximum number of placement groups reported in debug dumps.
    pub gcs_placement_group_debug_dump_max_entries: u64,
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            gcs_placement_group_waiting_removed_bundles_period_ms: 1_000,
            gcs_placement_group_log_scheduling_details: false,
            gcs_placement_group_debug_dump_max_entries: 100,
        }
    }
}

impl RayConfig {
    /// Parse from base64-encoded JSON (as sent by the launcher).
    pub fn from_base64_json(b64: &str) -> Result<Self, String> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| format!("base64 decode error: {e}"))?;
        let json_str =
            String::from_utf8(decoded).map_err(|e| format!("UTF-8 decode error: {e}"))?;
        Self::from_json(&json_str)
    }

    /// Parse from a JSON string. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, bool) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_bool()) {
                    config.$field = v;
                }
            };
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
            };
        }

        set_field!(gcs_placement_group_waiting_removed_bundles_period_ms, u64);
        set_field!(gcs_placement_group_log_scheduling_details, bool);
        set_field!(gcs_placement_group_debug_dump_max_entries, u64);

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides of the form `RAY_<name>`.
    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $ty:ty) => {
                let env_key = concat!("RAY_", stringify!($field));
                if let Ok(val) = std::env::var(env_key) {
                    match val.parse::<$ty>() {
                        Ok(v) => self.$field = v,
                        Err(_) => tracing::warn!(env_key, %val, "Ignoring malformed config override"),
                    }
                }
            };
        }

        env_override!(gcs_placement_group_waiting_removed_bundles_period_ms, u64);
        env_override!(gcs_placement_group_log_scheduling_details, bool);
        env_override!(gcs_placement_group_debug_dump_max_entries, u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RayConfig::default();
        assert_eq!(
            config.gcs_placement_group_waiting_removed_bundles_period_ms,
            1_000
        );
        assert!(!config.gcs_placement_group_log_scheduling_details);
    }

    #[test]
    fn test_json_parse() {
        let json = r#"{"gcs_placement_group_waiting_removed_bundles_period_ms": 250,
                       "gcs_placement_group_log_scheduling_details": true,
                       "unrelated_key": 3}"#;
        let config = RayConfig::from_json(json).unwrap();
        assert_eq!(config.gcs_placement_group_waiting_removed_bundles_period_ms, 250);
        assert!(config.gcs_placement_group_log_scheduling_details);
    }

    #[test]
    fn test_json_parse_rejects_garbage() {
        assert!(RayConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_base64_json_roundtrip() {
        use base64::Engine;
        let json = r#"{"gcs_placement_group_debug_dump_max_entries": 7}"#;
        let b64 = base64::engine::general_purpose::STANDARD.encode(json);
        let config = RayConfig::from_base64_json(&b64).unwrap();
        assert_eq!(config.gcs_placement_group_debug_dump_max_entries, 7);
    }
}
