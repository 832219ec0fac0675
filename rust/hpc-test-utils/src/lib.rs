// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for the scheduling crates.

pub mod generators;
pub mod mock_clients;
pub mod wait;

pub use generators::{make_cluster, make_nodes, JobBuilder};
pub use mock_clients::{FailingJobControl, RecordingJobControl};

/// Initialize tracing for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Create a temporary directory for test data.
pub fn test_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}
