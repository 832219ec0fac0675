// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler configuration.
//!
//! A plain struct with defaults, supporting:
//! - JSON or base64-encoded JSON config strings from the controller
//! - Environment variable overrides: `HPC_<UPPER_SNAKE_CASE_NAME>`
//!
//! The config is passed by reference into each component rather than held
//! in a process-wide singleton.

use std::fmt;
use std::str::FromStr;

use crate::constants::{DEFAULT_LOOP_SHUTDOWN_GRACE_MS, DEFAULT_TIME_LIMIT_SECS, ENV_PREFIX};

/// Which sub-node quantity is tracked as a consumable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumableResource {
    Cpu,
    Core,
    Socket,
}

/// Task layout across the nodes of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskDistribution {
    #[default]
    Block,
    Cyclic,
}

/// Unit at which the gang scheduler detects conflicts between jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GangGranularity {
    Node,
    Socket,
    Core,
    Cpu,
}

/// First action taken against a job pushed out of the active row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreemptMode {
    Off,
    Suspend,
    Requeue,
    Checkpoint,
    Cancel,
}

macro_rules! str_enum {
    ($ty:ident { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($ty))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $(Self::$variant => $name,)+
                };
                write!(f, "{name}")
            }
        }
    };
}

str_enum!(ConsumableResource { "cpu" => Cpu, "core" => Core, "socket" => Socket });
str_enum!(TaskDistribution { "block" => Block, "cyclic" => Cyclic });
str_enum!(GangGranularity { "node" => Node, "socket" => Socket, "core" => Core, "cpu" => Cpu });
str_enum!(PreemptMode {
    "off" => Off,
    "suspend" => Suspend,
    "requeue" => Requeue,
    "checkpoint" => Checkpoint,
    "cancel" => Cancel,
});

#[derive(Debug, Clone)]
pub struct SchedConfig {
    // ─── Node selection ───────────────────────────────────────
    pub consumable_resource: ConsumableResource,
    pub track_memory: bool,
    pub default_distribution: TaskDistribution,
    pub dynamic_blocks: bool,

    // ─── Gang scheduling ──────────────────────────────────────
    pub gang_time_slice_ms: u64,
    pub gang_granularity: GangGranularity,
    pub preempt_mode: PreemptMode,
    pub signal_retry_limit: u32,

    // ─── Backfill ─────────────────────────────────────────────
    pub backfill_interval_ms: u64,
    pub backfill_window_secs: u64,
    pub max_backfill_jobs: usize,
    pub default_time_limit_secs: u64,

    // ─── Background loops ─────────────────────────────────────
    pub loop_shutdown_grace_ms: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            consumable_resource: ConsumableResource::Cpu,
            track_memory: false,
            default_distribution: TaskDistribution::Block,
            dynamic_blocks: false,
            gang_time_slice_ms: 30_000,
            gang_granularity: GangGranularity::Cpu,
            preempt_mode: PreemptMode::Suspend,
            signal_retry_limit: 2,
            backfill_interval_ms: 30_000,
            backfill_window_secs: 24 * 60 * 60,
            max_backfill_jobs: 50,
            default_time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
            loop_shutdown_grace_ms: DEFAULT_LOOP_SHUTDOWN_GRACE_MS,
        }
    }
}

impl SchedConfig {
    /// Parse from base64-encoded JSON.
    pub fn from_base64_json(b64: &str) -> Result<Self, String> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| format!("base64 decode error: {e}"))?;
        let json_str =
            String::from_utf8(decoded).map_err(|e| format!("UTF-8 decode error: {e}"))?;
        Self::from_json(&json_str)
    }

    /// Parse from a JSON string. Unknown keys are ignored; a key with a
    /// value of the wrong type or an unknown enum name is an error.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, bool) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_bool()
                        .ok_or_else(|| format!("{} must be a bool", stringify!($field)))?;
                }
            };
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_u64()
                        .ok_or_else(|| format!("{} must be an unsigned int", stringify!($field)))?;
                }
            };
            ($field:ident, u32) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| format!("{} must be a u32", stringify!($field)))?;
                }
            };
            ($field:ident, usize) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_u64()
                        .and_then(|v| usize::try_from(v).ok())
                        .ok_or_else(|| format!("{} must be an unsigned int", stringify!($field)))?;
                }
            };
            ($field:ident, enum) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be a string", stringify!($field)))?
                        .parse()?;
                }
            };
        }

        set_field!(consumable_resource, enum);
        set_field!(track_memory, bool);
        set_field!(default_distribution, enum);
        set_field!(dynamic_blocks, bool);
        set_field!(gang_time_slice_ms, u64);
        set_field!(gang_granularity, enum);
        set_field!(preempt_mode, enum);
        set_field!(signal_retry_limit, u32);
        set_field!(backfill_interval_ms, u64);
        set_field!(backfill_window_secs, u64);
        set_field!(max_backfill_jobs, usize);
        set_field!(default_time_limit_secs, u64);
        set_field!(loop_shutdown_grace_ms, u64);

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides of the form `HPC_<NAME>`.
    /// Unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($($field:ident),+ $(,)?) => {
                $(
                    let env_key = format!("{}{}", ENV_PREFIX, stringify!($field).to_ascii_uppercase());
                    if let Ok(val) = std::env::var(&env_key) {
                        if let Ok(v) = val.parse() {
                            self.$field = v;
                        }
                    }
                )+
            };
        }

        env_override!(
            consumable_resource,
            track_memory,
            default_distribution,
            dynamic_blocks,
            gang_time_slice_ms,
            gang_granularity,
            preempt_mode,
            signal_retry_limit,
            backfill_interval_ms,
            backfill_window_secs,
            max_backfill_jobs,
            default_time_limit_secs,
            loop_shutdown_grace_ms,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedConfig::default();
        assert_eq!(config.consumable_resource, ConsumableResource::Cpu);
        assert_eq!(config.preempt_mode, PreemptMode::Suspend);
        assert_eq!(config.backfill_window_secs, 86_400);
        assert_eq!(config.default_time_limit_secs, DEFAULT_TIME_LIMIT_SECS);
    }

    #[test]
    fn test_json_parse() {
        let json = r#"{"consumable_resource": "core", "track_memory": true,
                       "preempt_mode": "Requeue", "max_backfill_jobs": 7}"#;
        let config = SchedConfig::from_json(json).unwrap();
        assert_eq!(config.consumable_resource, ConsumableResource::Core);
        assert!(config.track_memory);
        assert_eq!(config.preempt_mode, PreemptMode::Requeue);
        assert_eq!(config.max_backfill_jobs, 7);
    }

    #[test]
    fn test_json_rejects_bad_enum() {
        let err = SchedConfig::from_json(r#"{"gang_granularity": "rack"}"#).unwrap_err();
        assert!(err.contains("GangGranularity"));
    }

    #[test]
    fn test_json_rejects_wrong_type() {
        assert!(SchedConfig::from_json(r#"{"track_memory": 1}"#).is_err());
    }

    #[test]
    fn test_base64_json_roundtrip() {
        use base64::Engine;
        let json = r#"{"gang_time_slice_ms": 500}"#;
        let b64 = base64::engine::general_purpose::STANDARD.encode(json);
        let config = SchedConfig::from_base64_json(&b64).unwrap();
        assert_eq!(config.gang_time_slice_ms, 500);
    }

    #[test]
    fn test_enum_display_roundtrip() {
        for mode in [
            PreemptMode::Off,
            PreemptMode::Suspend,
            PreemptMode::Requeue,
            PreemptMode::Checkpoint,
            PreemptMode::Cancel,
        ] {
            assert_eq!(mode.to_string().parse::<PreemptMode>().unwrap(), mode);
        }
    }
}
