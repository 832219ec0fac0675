// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for the scheduling core: node sets, status/error, config.

pub mod config;
pub mod constants;
pub mod node_set;
pub mod status;

pub use node_set::NodeSet;
pub use status::{SchedError, SchedResult, StatusCode};

/// Job identifier as assigned by the job table.
pub type JobId = u32;
