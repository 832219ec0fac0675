// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node selector interface shared by the scheduling pass and backfill.

use hpc_common::{JobId, NodeSet, SchedResult};

use crate::job_allocation::NodeShare;
use crate::node_table::JobRequest;

/// What a selection call is allowed to assume and do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectMode {
    /// Test against free capacity and commit on success.
    RunNow,
    /// Test against physical capacity. Nothing is committed.
    TestOnly,
    /// Predict the earliest start time. Nothing is committed.
    WillRun,
}

/// Node count bounds for one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    pub min: u32,
    /// 0 means unlimited.
    pub max: u32,
    /// Preferred count; 0 means `min`.
    pub req: u32,
}

impl NodeLimits {
    pub fn new(min: u32, max: u32, req: u32) -> Self {
        Self { min, max, req }
    }

    pub fn for_request(request: &JobRequest) -> Self {
        Self {
            min: request.min_nodes.max(1),
            max: request.max_nodes,
            req: request.req_nodes,
        }
    }

    /// Whether `count` nodes is within bounds.
    pub fn admits(&self, count: u32) -> bool {
        count >= self.min && (self.max == 0 || count <= self.max)
    }
}

/// A successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub nodes: NodeSet,
    /// Now for immediate placements, later for `WillRun` predictions.
    pub start_time: u64,
    pub alloc_cpus: u32,
    /// Per-node shares; filled only when the placement was committed.
    pub shares: Vec<NodeShare>,
    /// The request fits, but only once running work moves off; try again
    /// on a later pass. Nothing was committed.
    pub deferred: bool,
    /// Running jobs whose resources this placement takes. When non-empty
    /// the allocation was committed suspended and runs once they yield.
    pub preempts: Vec<JobId>,
}

impl Placement {
    pub fn now(nodes: NodeSet, start_time: u64, alloc_cpus: u32) -> Self {
        Self {
            nodes,
            start_time,
            alloc_cpus,
            shares: Vec::new(),
            deferred: false,
            preempts: Vec::new(),
        }
    }

    /// Committed, but held until the jobs in `preempts` are suspended.
    pub fn is_held(&self) -> bool {
        !self.preempts.is_empty()
    }
}

/// Picks nodes for a job.
///
/// On success `candidates` is narrowed to the chosen nodes. On failure it
/// is left unchanged.
pub trait NodeSelector: Send + Sync {
    fn select(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        limits: NodeLimits,
        mode: SelectMode,
        now: u64,
    ) -> SchedResult<Placement>;

    /// `RunNow`, except that the resources of the running jobs in
    /// `preemptable` may be taken, earliest listed first. Selectors that
    /// cannot oversubscribe fall back to a plain `RunNow`.
    fn select_preempting(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        limits: NodeLimits,
        now: u64,
        preemptable: &[JobId],
    ) -> SchedResult<Placement> {
        let _ = preemptable;
        self.select(request, candidates, limits, SelectMode::RunNow, now)
    }

    /// Give back whatever the selector committed for `job_id`.
    fn release(&self, job_id: JobId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_admit() {
        let limits = NodeLimits::new(2, 4, 0);
        assert!(!limits.admits(1));
        assert!(limits.admits(2));
        assert!(limits.admits(4));
        assert!(!limits.admits(5));
        assert!(NodeLimits::new(1, 0, 0).admits(1000));
    }

    #[test]
    fn test_limits_from_request() {
        let mut req = JobRequest::new(1, 0, 1);
        req.max_nodes = 3;
        let limits = NodeLimits::for_request(&req);
        assert_eq!(limits, NodeLimits::new(1, 3, 0));
    }
}
