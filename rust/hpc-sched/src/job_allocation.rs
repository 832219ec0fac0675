// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-job allocation records and task layout.

use hpc_common::config::TaskDistribution;
use hpc_common::{JobId, NodeSet};
use serde::{Deserialize, Serialize};

/// The share of one node granted to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShare {
    pub node_index: usize,
    pub cpus: u16,
    /// Cores taken on each socket of the node.
    pub cores: Vec<u16>,
    pub memory_mb: u64,
}

impl NodeShare {
    /// Number of sockets on which this share holds at least one core.
    pub fn sockets(&self) -> u16 {
        self.cores.iter().filter(|&&c| c > 0).count() as u16
    }

    pub fn total_cores(&self) -> u16 {
        self.cores.iter().sum()
    }
}

/// Which nodes and sub-node resources a job was granted.
///
/// Exactly one record exists per active job id in a ledger; committing a
/// second record for the same id replaces the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAllocation {
    pub job_id: JobId,
    pub node_set: NodeSet,
    /// Node names in ascending node-index order.
    pub node_names: Vec<String>,
    /// One share per member of `node_set`, same order as `node_names`.
    pub shares: Vec<NodeShare>,
    /// True while the time-sliced dimension is handed back to the ledger.
    pub suspended: bool,
    pub start_time: u64,
    pub end_time: u64,
}

impl JobAllocation {
    pub fn total_cpus(&self) -> u32 {
        self.shares.iter().map(|s| u32::from(s.cpus)).sum()
    }

    pub fn share_for(&self, node_index: usize) -> Option<&NodeShare> {
        self.shares.iter().find(|s| s.node_index == node_index)
    }
}

/// Lay `num_tasks` tasks over nodes whose task capacities are `capacity`.
///
/// Every node receives at least one task when it has room for one, so the
/// effective task count is at least the node count. Tasks that do not fit
/// anywhere are dropped; callers size requests so this does not happen.
pub fn distribute_tasks(capacity: &[u32], num_tasks: u32, layout: TaskDistribution) -> Vec<u32> {
    let mut tasks = vec![0u32; capacity.len()];
    let mut remaining = num_tasks.max(capacity.len() as u32);

    match layout {
        TaskDistribution::Cyclic => {
            while remaining > 0 {
                let mut progressed = false;
                for (slot, cap) in tasks.iter_mut().zip(capacity) {
                    if remaining == 0 {
                        break;
                    }
                    if *slot < *cap {
                        *slot += 1;
                        remaining -= 1;
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
        }
        TaskDistribution::Block => {
            // One task everywhere first, so every chosen node is used.
            for (slot, cap) in tasks.iter_mut().zip(capacity) {
                if remaining > 0 && *cap > 0 {
                    *slot = 1;
                    remaining -= 1;
                }
            }
            for (slot, cap) in tasks.iter_mut().zip(capacity) {
                if remaining == 0 {
                    break;
                }
                let extra = cap.saturating_sub(*slot).min(remaining);
                *slot += extra;
                remaining -= extra;
            }
        }
    }
    tasks
}
