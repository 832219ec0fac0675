// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node, partition, and job-request records consumed from the job/node tables.

use std::fmt;

use hpc_common::config::TaskDistribution;
use hpc_common::{JobId, NodeSet};

use crate::topology::{ConnectionType, Geometry};

/// Physical description of one node. Immutable once the cluster is configured;
/// its position in the node table is its index for the cluster generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub cpus: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    pub real_memory_mb: u64,
    /// Position in a 3-D torus/mesh, if the system has one.
    pub coord: Option<[u16; 3]>,
}

impl NodeRecord {
    /// A single-socket node whose CPUs are all cores.
    pub fn new(name: impl Into<String>, cpus: u16) -> Self {
        Self {
            name: name.into(),
            cpus,
            sockets: 1,
            cores_per_socket: cpus,
            threads_per_core: 1,
            real_memory_mb: 0,
            coord: None,
        }
    }

    pub fn with_layout(mut self, sockets: u16, cores_per_socket: u16, threads_per_core: u16) -> Self {
        self.sockets = sockets.max(1);
        self.cores_per_socket = cores_per_socket.max(1);
        self.threads_per_core = threads_per_core.max(1);
        self
    }

    pub fn with_memory(mut self, real_memory_mb: u64) -> Self {
        self.real_memory_mb = real_memory_mb;
        self
    }

    pub fn with_coord(mut self, coord: [u16; 3]) -> Self {
        self.coord = Some(coord);
        self
    }

    pub fn total_cores(&self) -> u16 {
        self.sockets * self.cores_per_socket
    }
}

/// Partition limits and membership as seen by the schedulers.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub name: String,
    pub priority: u32,
    pub nodes: NodeSet,
    pub min_nodes: u32,
    /// 0 means unlimited.
    pub max_nodes: u32,
    pub max_time_secs: Option<u64>,
}

impl PartitionInfo {
    pub fn new(name: impl Into<String>, priority: u32, nodes: NodeSet) -> Self {
        Self {
            name: name.into(),
            priority,
            nodes,
            min_nodes: 1,
            max_nodes: 0,
            max_time_secs: None,
        }
    }
}

/// A job's resource request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    pub partition: String,
    pub priority: u32,
    pub min_nodes: u32,
    /// 0 means no upper bound.
    pub max_nodes: u32,
    /// Preferred node count; 0 means `min_nodes`.
    pub req_nodes: u32,
    pub num_procs: u32,
    pub cpus_per_task: u16,
    /// 0 means unset.
    pub ntasks_per_node: u16,
    pub memory_per_node_mb: u64,
    pub required_nodes: Option<NodeSet>,
    pub excluded_nodes: Option<NodeSet>,
    pub contiguous: bool,
    /// Job must not share nodes with any other job.
    pub exclusive: bool,
    pub distribution: Option<TaskDistribution>,
    pub geometry: Option<Geometry>,
    pub conn_type: ConnectionType,
    pub rotate: bool,
    pub time_limit_secs: Option<u64>,
}

impl JobRequest {
    pub fn new(job_id: JobId, min_nodes: u32, num_procs: u32) -> Self {
        Self {
            job_id,
            partition: String::new(),
            priority: 0,
            min_nodes,
            max_nodes: 0,
            req_nodes: 0,
            num_procs,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            memory_per_node_mb: 0,
            required_nodes: None,
            excluded_nodes: None,
            contiguous: false,
            exclusive: false,
            distribution: None,
            geometry: None,
            conn_type: ConnectionType::Any,
            rotate: true,
            time_limit_secs: None,
        }
    }

    /// Number of tasks implied by the processor count.
    pub fn num_tasks(&self) -> u32 {
        (self.num_procs / u32::from(self.cpus_per_task.max(1))).max(1)
    }
}

/// Why a job is still pending. A pending job accumulates these as
/// successive passes fail for different reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingReason {
    Resources,
    NoContiguousHole,
    GeometryMismatch,
    ConnectionTypeMismatch,
    BlockBusy,
    ReservedForHigherPriority,
    BeyondBackfillWindow,
    PartitionNodeLimit,
    RequiredNodesUnavailable,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resources => "waiting for resources",
            Self::NoContiguousHole => "no contiguous hole",
            Self::GeometryMismatch => "no block with requested geometry",
            Self::ConnectionTypeMismatch => "no block with requested connection type",
            Self::BlockBusy => "block busy, runnable later",
            Self::ReservedForHigherPriority => "waiting on higher-priority reservation",
            Self::BeyondBackfillWindow => "start beyond backfill window",
            Self::PartitionNodeLimit => "node count outside partition limits",
            Self::RequiredNodesUnavailable => "required nodes unavailable",
        }
    }

    /// Map a selector failure to the annotation shown to users.
    pub fn from_error(err: &hpc_common::SchedError) -> Self {
        use hpc_common::StatusCode;
        match err.code {
            StatusCode::NoContiguousHole => Self::NoContiguousHole,
            StatusCode::GeometryMismatch => Self::GeometryMismatch,
            StatusCode::ConnectionTypeMismatch => Self::ConnectionTypeMismatch,
            _ => Self::Resources,
        }
    }
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpc_common::SchedError;

    #[test]
    fn test_num_tasks() {
        let mut req = JobRequest::new(1, 2, 8);
        assert_eq!(req.num_tasks(), 8);
        req.cpus_per_task = 4;
        assert_eq!(req.num_tasks(), 2);
        req.num_procs = 0;
        assert_eq!(req.num_tasks(), 1);
    }

    #[test]
    fn test_node_layout() {
        let node = NodeRecord::new("n0", 16).with_layout(2, 4, 2);
        assert_eq!(node.total_cores(), 8);
        assert_eq!(node.threads_per_core, 2);
    }

    #[test]
    fn test_reason_from_error() {
        assert_eq!(
            PendingReason::from_error(&SchedError::no_contiguous_hole("x")),
            PendingReason::NoContiguousHole
        );
        assert_eq!(
            PendingReason::from_error(&SchedError::infeasible("x")),
            PendingReason::Resources
        );
    }
}
