// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduling core for a cluster workload manager.
//!
//! Node selection over a consumable-resource ledger, topology block
//! matching, gang time-slicing with preemption, and backfill planning.

pub mod backfill_planner;
pub mod consecutive_selector;
pub mod gang_scheduler;
pub mod job_allocation;
pub mod job_control;
pub mod job_scheduler;
pub mod node_table;
pub mod periodic_loop;
pub mod resource_ledger;
pub mod selector;
pub mod state_store;
pub mod topology;

pub use backfill_planner::{BackfillDecision, BackfillHost, BackfillPlan, BackfillPlanner, BackfillSnapshot};
pub use consecutive_selector::ConsecutiveRunSelector;
pub use gang_scheduler::{Footprint, GangScheduler, RowState, SignalState};
pub use job_allocation::{JobAllocation, NodeShare};
pub use job_control::{Escalator, JobControl, LedgerJobControl, SignalOp};
pub use job_scheduler::JobScheduler;
pub use node_table::{JobRequest, NodeRecord, PartitionInfo, PendingReason};
pub use periodic_loop::PeriodicLoop;
pub use resource_ledger::ResourceLedger;
pub use selector::{NodeLimits, NodeSelector, Placement, SelectMode};
pub use topology::{BlockMatcher, BlockSelector, ConnectionType, Geometry, TopologyBlock};
