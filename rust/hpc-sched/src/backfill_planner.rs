// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Backfill planner.
//!
//! Each pass walks pending jobs in descending priority and asks the
//! selector when each could start, against a timeline of node-space-time
//! windows. Jobs that can start now without touching nodes already
//! reserved for higher-priority jobs are started with a boosted priority.
//! Jobs that can start later inside the planning window get a reservation
//! layered into the timeline, so every lower-priority job is evaluated
//! against what higher-priority jobs have already claimed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hpc_common::config::SchedConfig;
use hpc_common::constants::BACKFILL_MAX_ATTEMPTS_PER_JOB;
use hpc_common::{JobId, NodeSet};
use hpc_util::time::Stopwatch;
use parking_lot::Mutex;

use crate::node_table::{JobRequest, PartitionInfo, PendingReason};
use crate::periodic_loop::PeriodicLoop;
use crate::selector::{NodeLimits, NodeSelector, SelectMode};

/// Nodes free for the whole of `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpaceWindow {
    pub begin: u64,
    pub end: u64,
    pub nodes: NodeSet,
}

/// Time-ordered, gap-free windows covering `[start, horizon)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpaceTimeline {
    windows: Vec<NodeSpaceWindow>,
}

impl NodeSpaceTimeline {
    pub fn new(begin: u64, end: u64, nodes: NodeSet) -> Self {
        Self {
            windows: vec![NodeSpaceWindow { begin, end, nodes }],
        }
    }

    pub fn windows(&self) -> &[NodeSpaceWindow] {
        &self.windows
    }

    pub fn horizon(&self) -> u64 {
        self.windows.last().map(|w| w.end).unwrap_or(0)
    }

    /// Nodes free in every window overlapping `[start, end)`.
    pub fn available(&self, start: u64, end: u64) -> NodeSet {
        let mut overlapping = self.windows.iter().filter(|w| w.begin < end && w.end > start);
        let Some(first) = overlapping.next() else {
            let size = self.windows.first().map(|w| w.nodes.size()).unwrap_or(0);
            return NodeSet::new(size);
        };
        let mut nodes = first.nodes.clone();
        for w in overlapping {
            nodes.intersect_with(&w.nodes);
        }
        nodes
    }

    /// End of the window containing `t`, if `t` is inside the timeline.
    pub fn next_boundary_after(&self, t: u64) -> Option<u64> {
        self.windows
            .iter()
            .find(|w| w.begin <= t && t < w.end)
            .map(|w| w.end)
    }

    /// Remove `nodes` from every window in `[start, end)`, splitting
    /// windows at the boundaries. The span is clipped to the timeline.
    pub fn add_reservation(&mut self, start: u64, end: u64, nodes: &NodeSet) {
        let begin = self.windows.first().map(|w| w.begin).unwrap_or(0);
        let start = start.max(begin);
        let end = end.min(self.horizon());
        if start >= end {
            return;
        }
        self.split_at(start);
        self.split_at(end);
        for w in self.windows.iter_mut().filter(|w| w.begin >= start && w.end <= end) {
            w.nodes.subtract(nodes);
        }
    }

    fn split_at(&mut self, t: u64) {
        let Some(pos) = self.windows.iter().position(|w| w.begin < t && t < w.end) else {
            return;
        };
        let tail = NodeSpaceWindow {
            begin: t,
            end: self.windows[pos].end,
            nodes: self.windows[pos].nodes.clone(),
        };
        self.windows[pos].end = t;
        self.windows.insert(pos + 1, tail);
    }
}

/// What a pass decided for one pending job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillDecision {
    StartNow { nodes: NodeSet, boosted_priority: u32 },
    Reserved { start_time: u64, nodes: NodeSet },
    /// Not placed this pass. Not a verdict on feasibility.
    Skipped { reason: PendingReason },
}

#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub now: u64,
    /// In evaluation order.
    pub decisions: Vec<(JobId, BackfillDecision)>,
    pub predicted_starts: BTreeMap<JobId, u64>,
    pub timeline: NodeSpaceTimeline,
}

impl BackfillPlan {
    pub fn decision(&self, job_id: JobId) -> Option<&BackfillDecision> {
        self.decisions.iter().find(|(id, _)| *id == job_id).map(|(_, d)| d)
    }

    /// Jobs to start now, with their nodes and boosted priority.
    pub fn starts(&self) -> impl Iterator<Item = (JobId, &NodeSet, u32)> + '_ {
        self.decisions.iter().filter_map(|(id, d)| match d {
            BackfillDecision::StartNow { nodes, boosted_priority } => Some((*id, nodes, *boosted_priority)),
            _ => None,
        })
    }

    pub fn reservation_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|(_, d)| matches!(d, BackfillDecision::Reserved { .. }))
            .count()
    }
}

/// Cluster state handed to one pass.
#[derive(Debug, Clone)]
pub struct BackfillSnapshot {
    pub now: u64,
    /// Bumped by the host on any job, node or partition change.
    pub state_version: i64,
    pub pending: Vec<JobRequest>,
    pub partitions: Vec<PartitionInfo>,
    /// Nodes up and schedulable.
    pub usable: NodeSet,
}

/// Supplies snapshots to the planner loop and applies its starts.
pub trait BackfillHost: Send + Sync {
    fn snapshot(&self) -> BackfillSnapshot;
    fn apply(&self, plan: &BackfillPlan);
}

#[derive(Default)]
struct BackfillState {
    last_version: Option<i64>,
    last_plan: Option<BackfillPlan>,
    passes: u64,
}

pub struct BackfillPlanner {
    selector: Arc<dyn NodeSelector>,
    window_secs: u64,
    max_reservations: usize,
    default_time_limit_secs: u64,
    interval: Duration,
    shutdown_grace: Duration,
    state: Mutex<BackfillState>,
}

impl BackfillPlanner {
    pub fn new(config: &SchedConfig, selector: Arc<dyn NodeSelector>) -> Self {
        Self {
            selector,
            window_secs: config.backfill_window_secs,
            max_reservations: config.max_backfill_jobs,
            default_time_limit_secs: config.default_time_limit_secs,
            interval: Duration::from_millis(config.backfill_interval_ms),
            shutdown_grace: Duration::from_millis(config.loop_shutdown_grace_ms),
            state: Mutex::new(BackfillState::default()),
        }
    }

    /// Plan one pass over `snapshot`. Never commits anything.
    ///
    /// Once a job needs a reservation past the cap, the pass stops: every
    /// lower-priority job is skipped, since an unreserved start time could
    /// not be protected from them.
    pub fn plan(&self, snapshot: &BackfillSnapshot) -> BackfillPlan {
        let now = snapshot.now;
        let horizon = now.saturating_add(self.window_secs);
        let mut timeline = NodeSpaceTimeline::new(now, horizon, snapshot.usable.clone());

        let mut pending: Vec<&JobRequest> = snapshot.pending.iter().collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.job_id.cmp(&b.job_id)));
        let boosted_priority = pending.first().map(|j| j.priority.saturating_add(1)).unwrap_or(1);

        let mut plan = BackfillPlan {
            now,
            decisions: Vec::with_capacity(pending.len()),
            predicted_starts: BTreeMap::new(),
            timeline: timeline.clone(),
        };
        let mut reservations = 0usize;
        let mut capped = false;

        for request in pending {
            if capped {
                plan.decisions.push((
                    request.job_id,
                    BackfillDecision::Skipped {
                        reason: PendingReason::ReservedForHigherPriority,
                    },
                ));
                continue;
            }
            let decision = match self.evaluate(request, snapshot, &timeline, horizon) {
                Err(reason) => BackfillDecision::Skipped { reason },
                Ok((start, nodes, limit)) => {
                    plan.predicted_starts.insert(request.job_id, start);
                    if start == now {
                        timeline.add_reservation(now, now.saturating_add(limit), &nodes);
                        tracing::info!(job_id = request.job_id, nodes = %nodes.to_range_string(), "Backfill starting job");
                        BackfillDecision::StartNow {
                            nodes,
                            boosted_priority,
                        }
                    } else if reservations < self.max_reservations {
                        timeline.add_reservation(start, start.saturating_add(limit), &nodes);
                        reservations += 1;
                        tracing::debug!(job_id = request.job_id, start, "Backfill reservation");
                        BackfillDecision::Reserved {
                            start_time: start,
                            nodes,
                        }
                    } else {
                        capped = true;
                        tracing::debug!(
                            job_id = request.job_id,
                            max_reservations = self.max_reservations,
                            "Backfill reservation limit reached, ending pass"
                        );
                        BackfillDecision::Skipped {
                            reason: PendingReason::ReservedForHigherPriority,
                        }
                    }
                }
            };
            plan.decisions.push((request.job_id, decision));
        }

        plan.timeline = timeline;
        plan
    }

    /// Earliest start for one job against the current timeline, with the
    /// nodes and time limit it would use.
    fn evaluate(
        &self,
        request: &JobRequest,
        snapshot: &BackfillSnapshot,
        timeline: &NodeSpaceTimeline,
        horizon: u64,
    ) -> Result<(u64, NodeSet, u64), PendingReason> {
        let Some(partition) = snapshot.partitions.iter().find(|p| p.name == request.partition) else {
            tracing::error!(job_id = request.job_id, partition = %request.partition, "Pending job in unknown partition");
            return Err(PendingReason::Resources);
        };
        let limits = partition_limits(request, partition).ok_or(PendingReason::PartitionNodeLimit)?;
        let limit = match (request.time_limit_secs, partition.max_time_secs) {
            (Some(job), Some(part)) => job.min(part),
            (Some(job), None) => job,
            (None, Some(part)) => part,
            (None, None) => self.default_time_limit_secs,
        };

        let mut start = snapshot.now;
        let mut reason = PendingReason::Resources;
        for _ in 0..BACKFILL_MAX_ATTEMPTS_PER_JOB {
            if start >= horizon {
                return Err(PendingReason::BeyondBackfillWindow);
            }
            let mut candidates = timeline.available(start, start.saturating_add(limit));
            candidates.intersect_with(&partition.nodes);
            if let Some(required) = &request.required_nodes {
                if !required.is_subset_of(&candidates) {
                    reason = PendingReason::RequiredNodesUnavailable;
                    start = advance(timeline, start, horizon, reason)?;
                    continue;
                }
            }

            match self
                .selector
                .select(request, &mut candidates, limits, SelectMode::WillRun, start)
            {
                Ok(placement) if !placement.deferred => {
                    if placement.start_time > start {
                        // Re-check at the predicted time against that
                        // time's windows.
                        start = placement.start_time;
                        continue;
                    }
                    return Ok((start, placement.nodes, limit));
                }
                Ok(_) => reason = PendingReason::BlockBusy,
                Err(e) => {
                    tracing::trace!(job_id = request.job_id, start, error = %e, "Does not fit");
                    reason = PendingReason::from_error(&e);
                }
            }
            start = advance(timeline, start, horizon, reason)?;
        }
        tracing::debug!(job_id = request.job_id, "Backfill attempts exhausted");
        Err(reason)
    }

    /// Plan against the host's snapshot and hand the plan back. Returns
    /// `None` when nothing changed since the last pass.
    pub fn run_pass(&self, host: &dyn BackfillHost) -> Option<BackfillPlan> {
        let snapshot = host.snapshot();
        {
            let state = self.state.lock();
            if state.last_version == Some(snapshot.state_version) {
                return None;
            }
        }
        let timer = Stopwatch::new();
        let plan = self.plan(&snapshot);
        host.apply(&plan);

        let mut state = self.state.lock();
        state.last_version = Some(snapshot.state_version);
        state.last_plan = Some(plan.clone());
        state.passes += 1;
        tracing::debug!(
            pass = state.passes,
            pending = snapshot.pending.len(),
            started = plan.starts().count(),
            reserved = plan.reservation_count(),
            elapsed_us = timer.elapsed_us(),
            "Backfill pass complete"
        );
        Some(plan)
    }

    pub fn last_plan(&self) -> Option<BackfillPlan> {
        self.state.lock().last_plan.clone()
    }

    pub fn passes(&self) -> u64 {
        self.state.lock().passes
    }

    /// Spawn the periodic backfill loop.
    pub fn spawn(self: &Arc<Self>, host: Arc<dyn BackfillHost>) -> PeriodicLoop {
        let this = Arc::clone(self);
        PeriodicLoop::spawn("backfill", self.interval, move || {
            this.run_pass(host.as_ref());
        })
        .with_shutdown_grace(self.shutdown_grace)
    }
}

/// Move a job that does not fit at `start` to the next window boundary.
fn advance(timeline: &NodeSpaceTimeline, start: u64, horizon: u64, reason: PendingReason) -> Result<u64, PendingReason> {
    match timeline.next_boundary_after(start) {
        Some(next) if next < horizon => Ok(next),
        _ => Err(reason),
    }
}

/// Combine job and partition node-count limits. `None` when they admit
/// no count at all.
fn partition_limits(request: &JobRequest, partition: &PartitionInfo) -> Option<NodeLimits> {
    let min = request.min_nodes.max(partition.min_nodes).max(1);
    let max = match (request.max_nodes, partition.max_nodes) {
        (0, p) => p,
        (j, 0) => j,
        (j, p) => j.min(p),
    };
    if max != 0 && min > max {
        return None;
    }
    Some(NodeLimits::new(min, max, request.req_nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consecutive_selector::ConsecutiveRunSelector;
    use crate::job_allocation::JobAllocation;
    use crate::node_table::NodeRecord;
    use crate::resource_ledger::ResourceLedger;
    use hpc_common::config::{ConsumableResource, TaskDistribution};

    const NOW: u64 = 1_000;

    fn setup(n: usize, window: u64) -> (BackfillPlanner, Arc<ResourceLedger>) {
        let nodes = (0..n).map(|i| NodeRecord::new(format!("n{i}"), 1)).collect();
        let ledger = Arc::new(ResourceLedger::new(nodes, ConsumableResource::Cpu, false).unwrap());
        let selector = Arc::new(ConsecutiveRunSelector::new(
            ledger.clone(),
            TaskDistribution::Block,
            3600,
        ));
        let config = SchedConfig {
            backfill_window_secs: window,
            ..Default::default()
        };
        (BackfillPlanner::new(&config, selector), ledger)
    }

    fn occupy(ledger: &ResourceLedger, job_id: JobId, nodes: &[usize], end_time: u64) {
        let n = ledger.node_count();
        let shares = nodes.iter().map(|&i| ledger.with_state(|s| s.build_share(i, 1, 0))).collect();
        ledger.commit(JobAllocation {
            job_id,
            node_set: NodeSet::from_indices(n, nodes.iter().copied()),
            node_names: nodes.iter().map(|i| format!("n{i}")).collect(),
            shares,
            suspended: false,
            start_time: 0,
            end_time,
        });
    }

    fn job(job_id: JobId, priority: u32, nodes: u32, limit: u64) -> JobRequest {
        let mut req = JobRequest::new(job_id, nodes, nodes);
        req.partition = "batch".to_string();
        req.priority = priority;
        req.time_limit_secs = Some(limit);
        req
    }

    fn snapshot(n: usize, pending: Vec<JobRequest>) -> BackfillSnapshot {
        BackfillSnapshot {
            now: NOW,
            state_version: 1,
            pending,
            partitions: vec![PartitionInfo::new("batch", 1, NodeSet::full(n))],
            usable: NodeSet::full(n),
        }
    }

    #[test]
    fn test_timeline_split_and_available() {
        let mut t = NodeSpaceTimeline::new(0, 100, NodeSet::full(4));
        t.add_reservation(10, 30, &NodeSet::from_indices(4, [0, 1]));
        assert_eq!(t.windows().len(), 3);
        assert_eq!(t.available(0, 10), NodeSet::full(4));
        assert_eq!(t.available(5, 15), NodeSet::from_indices(4, [2, 3]));
        assert_eq!(t.available(30, 100), NodeSet::full(4));
        assert_eq!(t.next_boundary_after(12), Some(30));
        assert_eq!(t.next_boundary_after(100), None);

        // Layered reservation inside an existing window.
        t.add_reservation(20, 200, &NodeSet::from_indices(4, [2]));
        assert_eq!(t.horizon(), 100);
        assert_eq!(t.available(25, 26), NodeSet::from_indices(4, [3]));
        assert_eq!(t.available(50, 60), NodeSet::from_indices(4, [0, 1, 3]));
    }

    #[test]
    fn test_free_cluster_starts_by_priority() {
        let (planner, _ledger) = setup(4, 3600);
        let plan = planner.plan(&snapshot(4, vec![job(1, 5, 3, 100), job(2, 9, 2, 100)]));
        assert_eq!(plan.decisions[0].0, 2);
        match plan.decision(2).unwrap() {
            BackfillDecision::StartNow { nodes, boosted_priority } => {
                assert_eq!(nodes.count(), 2);
                assert_eq!(*boosted_priority, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Only two nodes left now; the three-node job waits for job 2.
        assert_eq!(
            plan.decision(1),
            Some(&BackfillDecision::Reserved {
                start_time: NOW + 100,
                nodes: NodeSet::from_indices(4, 0..3),
            })
        );
    }

    #[test]
    fn test_short_job_backfills_ahead_of_reservation() {
        let (planner, ledger) = setup(4, 3600);
        occupy(&ledger, 100, &[0, 1], NOW + 100);
        let pending = vec![job(1, 10, 4, 500), job(2, 5, 2, 50), job(3, 1, 2, 200)];
        let plan = planner.plan(&snapshot(4, pending));

        assert_eq!(plan.predicted_starts[&1], NOW + 100);
        assert!(matches!(plan.decision(1), Some(BackfillDecision::Reserved { .. })));
        assert!(matches!(plan.decision(2), Some(BackfillDecision::StartNow { .. })));
        // Would run into job 1's reservation, so it goes after it.
        assert_eq!(plan.predicted_starts[&3], NOW + 600);

        // Starting job 2 does not delay job 1.
        let alone = planner.plan(&snapshot(4, vec![job(1, 10, 4, 500)]));
        assert_eq!(alone.predicted_starts[&1], plan.predicted_starts[&1]);
    }

    #[test]
    fn test_start_beyond_window_skipped() {
        let (planner, ledger) = setup(4, 3600);
        occupy(&ledger, 100, &[0, 1, 2, 3], NOW + 7200);
        let plan = planner.plan(&snapshot(4, vec![job(1, 1, 4, 60)]));
        assert_eq!(
            plan.decision(1),
            Some(&BackfillDecision::Skipped {
                reason: PendingReason::BeyondBackfillWindow
            })
        );
        assert!(plan.predicted_starts.is_empty());
        assert_eq!(plan.timeline.windows().len(), 1);
    }

    #[test]
    fn test_partition_limits() {
        let (planner, _ledger) = setup(4, 3600);
        let mut snap = snapshot(4, vec![job(1, 1, 3, 60)]);
        snap.partitions[0].max_nodes = 2;
        let plan = planner.plan(&snap);
        assert_eq!(
            plan.decision(1),
            Some(&BackfillDecision::Skipped {
                reason: PendingReason::PartitionNodeLimit
            })
        );
    }

    #[test]
    fn test_reservation_cap() {
        let (mut planner, ledger) = setup(2, 3600);
        planner.max_reservations = 1;
        occupy(&ledger, 100, &[0, 1], NOW + 100);
        let plan = planner.plan(&snapshot(2, vec![job(1, 9, 2, 60), job(2, 8, 2, 60)]));
        assert!(matches!(plan.decision(1), Some(BackfillDecision::Reserved { .. })));
        assert_eq!(
            plan.decision(2),
            Some(&BackfillDecision::Skipped {
                reason: PendingReason::ReservedForHigherPriority
            })
        );
    }

    #[test]
    fn test_reservation_cap_ends_pass() {
        let (mut planner, ledger) = setup(3, 3600);
        planner.max_reservations = 1;
        occupy(&ledger, 100, &[0, 1], NOW + 100);
        let pending = vec![job(1, 9, 2, 60), job(2, 8, 3, 60), job(3, 1, 1, 1000)];
        let plan = planner.plan(&snapshot(3, pending.clone()));

        assert!(matches!(plan.decision(1), Some(BackfillDecision::Reserved { .. })));
        assert_eq!(plan.predicted_starts[&2], NOW + 160);
        let held_back = Some(&BackfillDecision::Skipped {
            reason: PendingReason::ReservedForHigherPriority,
        });
        assert_eq!(plan.decision(2), held_back);
        // Node 2 is free now, but job 3 would hold it past job 2's start.
        assert_eq!(plan.decision(3), held_back);
        assert_eq!(plan.starts().count(), 0);

        let without_low = planner.plan(&snapshot(3, pending[..2].to_vec()));
        assert_eq!(without_low.predicted_starts[&2], plan.predicted_starts[&2]);
    }

    #[test]
    fn test_unfittable_job_skipped_not_failed() {
        let (planner, _ledger) = setup(2, 3600);
        let plan = planner.plan(&snapshot(2, vec![job(1, 1, 3, 60)]));
        assert_eq!(
            plan.decision(1),
            Some(&BackfillDecision::Skipped {
                reason: PendingReason::Resources
            })
        );
    }

    struct StaticHost {
        snapshot: BackfillSnapshot,
        applied: Mutex<Vec<JobId>>,
    }

    impl BackfillHost for StaticHost {
        fn snapshot(&self) -> BackfillSnapshot {
            self.snapshot.clone()
        }
        fn apply(&self, plan: &BackfillPlan) {
            self.applied.lock().extend(plan.starts().map(|(id, _, _)| id));
        }
    }

    #[test]
    fn test_run_pass_skips_unchanged_state() {
        let (planner, _ledger) = setup(2, 3600);
        let host = StaticHost {
            snapshot: snapshot(2, vec![job(1, 1, 1, 60)]),
            applied: Mutex::new(Vec::new()),
        };
        assert!(planner.run_pass(&host).is_some());
        assert!(planner.run_pass(&host).is_none());
        assert_eq!(*host.applied.lock(), vec![1]);
        assert_eq!(planner.passes(), 1);
        assert!(planner.last_plan().is_some());
    }
}
