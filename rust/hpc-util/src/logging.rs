// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize logging for a scheduler component.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (HPC_SCHED_LOG_LEVEL or RUST_LOG)
/// - Optional file output
/// - Component name in the first log line
///
/// Returns an error if the log file cannot be opened.
pub fn init_logging(
    component: &str,
    log_dir: Option<&Path>,
    verbosity: i32,
) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_env("HPC_SCHED_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(dir) = log_dir {
        let log_file = dir.join(format!("{component}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        subscriber.with_writer(std::sync::Mutex::new(file)).init();
    } else {
        subscriber.init();
    }

    tracing::info!(component, "Scheduler logging initialized");
    Ok(())
}

fn level_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for_verbosity(-1), "info");
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(1), "debug");
        assert_eq!(level_for_verbosity(5), "trace");
    }
}
