// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared across the scheduling crates.

/// Tag written at the head of a saved ledger state stream.
pub const STATE_PLUGIN_TAG: &str = "select/consumable";

/// Version of the saved ledger state layout. Bump on any record change.
pub const STATE_VERSION: u16 = 3;

/// Time limit used when neither the job nor its partition has one (one year).
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 365 * 24 * 60 * 60;

/// Upper bound on node counts handed to a selector, prevents overflow.
pub const MAX_NODE_COUNT: u32 = 500_000;

/// Prefix for environment overrides of `SchedConfig` fields.
pub const ENV_PREFIX: &str = "HPC_";

/// Maximum number of re-evaluations of one job inside a backfill pass.
pub const BACKFILL_MAX_ATTEMPTS_PER_JOB: usize = 16;

/// How long a stopping background loop may take before it is reported stuck.
pub const DEFAULT_LOOP_SHUTDOWN_GRACE_MS: u64 = 5_000;
