// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node table and job request builders.

use std::sync::Arc;

use hpc_common::config::{ConsumableResource, TaskDistribution};
use hpc_common::{JobId, NodeSet};
use hpc_sched::{ConsecutiveRunSelector, JobRequest, NodeRecord, ResourceLedger};

/// Nodes named `node0..` with the given CPU counts, single socket.
pub fn make_nodes(cpus: &[u16]) -> Vec<NodeRecord> {
    cpus.iter()
        .enumerate()
        .map(|(i, c)| NodeRecord::new(format!("node{i}"), *c))
        .collect()
}

/// A CPU-accounted ledger and a block-layout selector over `cpus`.
pub fn make_cluster(cpus: &[u16]) -> (Arc<ResourceLedger>, Arc<ConsecutiveRunSelector>) {
    let ledger = Arc::new(
        ResourceLedger::new(make_nodes(cpus), ConsumableResource::Cpu, false)
            .expect("Failed to build ledger"),
    );
    let selector = Arc::new(ConsecutiveRunSelector::new(
        Arc::clone(&ledger),
        TaskDistribution::Block,
        3600,
    ));
    (ledger, selector)
}

/// Builder for `JobRequest` in tests.
pub struct JobBuilder {
    request: JobRequest,
}

impl JobBuilder {
    pub fn new(job_id: JobId) -> Self {
        Self {
            request: JobRequest::new(job_id, 1, 1),
        }
    }

    pub fn nodes(mut self, min_nodes: u32) -> Self {
        self.request.min_nodes = min_nodes;
        self
    }

    pub fn procs(mut self, num_procs: u32) -> Self {
        self.request.num_procs = num_procs;
        self
    }

    pub fn partition(mut self, name: &str) -> Self {
        self.request.partition = name.to_string();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn time_limit(mut self, secs: u64) -> Self {
        self.request.time_limit_secs = Some(secs);
        self
    }

    pub fn contiguous(mut self) -> Self {
        self.request.contiguous = true;
        self
    }

    pub fn required(mut self, nodes: NodeSet) -> Self {
        self.request.required_nodes = Some(nodes);
        self
    }

    pub fn build(self) -> JobRequest {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let req = JobBuilder::new(7).nodes(3).procs(6).partition("batch").priority(4).build();
        assert_eq!(req.job_id, 7);
        assert_eq!(req.min_nodes, 3);
        assert_eq!(req.num_tasks(), 6);
        assert_eq!(req.partition, "batch");
    }

    #[test]
    fn test_make_cluster() {
        let (ledger, _selector) = make_cluster(&[2, 4]);
        assert_eq!(ledger.node_names(), vec!["node0", "node1"]);
        assert_eq!(ledger.available_cpus(1), 4);
    }
}
