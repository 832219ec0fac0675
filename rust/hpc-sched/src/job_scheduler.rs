// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduling pass: ties the selector, the ledger and the gang scheduler
//! together for job starts and completions, and keeps the pending queue
//! with its reason annotations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hpc_common::{JobId, NodeSet, SchedError, SchedResult};
use hpc_util::time::current_time_secs;
use parking_lot::Mutex;

use crate::backfill_planner::{BackfillDecision, BackfillHost, BackfillPlan, BackfillSnapshot};
use crate::gang_scheduler::{Footprint, GangScheduler};
use crate::job_control::ForcedRemoval;
use crate::node_table::{JobRequest, PartitionInfo, PendingReason};
use crate::resource_ledger::ResourceLedger;
use crate::selector::{NodeLimits, NodeSelector, Placement, SelectMode};

/// A queued job and every reason it has been held back so far.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub request: JobRequest,
    pub reasons: Vec<PendingReason>,
}

impl PendingJob {
    fn note(&mut self, reason: PendingReason) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    partitions: HashMap<String, PartitionInfo>,
    pending: BTreeMap<JobId, PendingJob>,
    /// Running job to partition name.
    running: HashMap<JobId, String>,
    failed: HashMap<JobId, SchedError>,
    /// Bumped on queue or partition changes.
    changes: i64,
}

/// With a gang scheduler, jobs may start held on resources that jobs of
/// their own or lower-priority partitions still run on. The gang
/// scheduler's job control must then be a `LedgerJobControl` over the same
/// ledger so suspends and resumes move the CPU accounting.
pub struct JobScheduler {
    ledger: Arc<ResourceLedger>,
    selector: Arc<dyn NodeSelector>,
    gang: Option<Arc<GangScheduler>>,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        selector: Arc<dyn NodeSelector>,
        gang: Option<Arc<GangScheduler>>,
    ) -> Self {
        Self {
            ledger,
            selector,
            gang,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn add_partition(&self, partition: PartitionInfo) {
        if let Some(gang) = &self.gang {
            gang.add_partition(partition.name.clone(), partition.priority);
        }
        let mut state = self.state.lock();
        state.partitions.insert(partition.name.clone(), partition);
        state.changes += 1;
    }

    /// Queue a job for the next scheduling pass.
    pub fn submit(&self, request: JobRequest) {
        let mut state = self.state.lock();
        tracing::debug!(job_id = request.job_id, partition = %request.partition, "Job submitted");
        state.pending.insert(
            request.job_id,
            PendingJob {
                request,
                reasons: Vec::new(),
            },
        );
        state.changes += 1;
    }

    /// Try to start `request` now on its partition's nodes.
    pub fn start_job(&self, request: &JobRequest, now: u64) -> SchedResult<Placement> {
        let nodes = self.partition_nodes(&request.partition)?;
        self.start_on(request, nodes, now)
    }

    fn partition_nodes(&self, name: &str) -> SchedResult<NodeSet> {
        self.state
            .lock()
            .partitions
            .get(name)
            .map(|p| p.nodes.clone())
            .ok_or_else(|| SchedError::lookup_failure(format!("partition {name:?} not found")))
    }

    /// Running jobs whose resources `request` may take under gang
    /// scheduling: those of its own and lower-priority partitions, lowest
    /// priority and most recent first.
    fn preemptable_for(&self, request: &JobRequest) -> Vec<JobId> {
        if !self.gang.as_ref().is_some_and(|g| g.preempts()) {
            return Vec::new();
        }
        let state = self.state.lock();
        let Some(own) = state.partitions.get(&request.partition) else {
            return Vec::new();
        };
        let mut jobs: Vec<(u32, JobId)> = state
            .running
            .iter()
            .filter_map(|(job_id, name)| {
                let priority = state.partitions.get(name)?.priority;
                (priority <= own.priority).then_some((priority, *job_id))
            })
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        jobs.into_iter().map(|(_, job_id)| job_id).collect()
    }

    fn start_on(&self, request: &JobRequest, mut candidates: NodeSet, now: u64) -> SchedResult<Placement> {
        let limits = NodeLimits::for_request(request);
        let preemptable = self.preemptable_for(request);
        let placement = if preemptable.is_empty() {
            self.selector
                .select(request, &mut candidates, limits, SelectMode::RunNow, now)?
        } else {
            self.selector
                .select_preempting(request, &mut candidates, limits, now, &preemptable)?
        };
        if placement.deferred {
            return Ok(placement);
        }

        if let Some(gang) = &self.gang {
            let universe = placement.nodes.size();
            let footprint = match self.ledger.allocation(request.job_id) {
                Some(alloc) => Footprint::from_shares(universe, &alloc.shares, gang.granularity()),
                None => Footprint::whole_nodes(placement.nodes.clone()),
            };
            let registered = if placement.is_held() {
                gang.add_held_job(&request.partition, request.job_id, footprint)
            } else {
                gang.add_job(&request.partition, request.job_id, footprint)
            };
            if let Err(e) = registered {
                tracing::error!(job_id = request.job_id, error = %e, "Started job not gang scheduled");
            }
        }

        let mut state = self.state.lock();
        state.pending.remove(&request.job_id);
        state.running.insert(request.job_id, request.partition.clone());
        state.changes += 1;
        tracing::info!(
            job_id = request.job_id,
            nodes = %placement.nodes.to_range_string(),
            cpus = placement.alloc_cpus,
            held = placement.is_held(),
            "Job started"
        );
        Ok(placement)
    }

    /// One pass over the pending queue in priority order. Returns the jobs
    /// started.
    pub fn schedule_pending(&self, now: u64) -> Vec<JobId> {
        self.reap_forced_removals();

        let mut queue: Vec<JobRequest> = {
            let state = self.state.lock();
            state.pending.values().map(|p| p.request.clone()).collect()
        };
        queue.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.job_id.cmp(&b.job_id)));

        let mut started = Vec::new();
        for request in &queue {
            let reason = match self.start_job(request, now) {
                Ok(placement) if !placement.deferred => {
                    started.push(request.job_id);
                    continue;
                }
                Ok(_) => PendingReason::BlockBusy,
                Err(e) => {
                    if e.is_lookup_failure() {
                        tracing::error!(job_id = request.job_id, error = %e, "Job skipped");
                    }
                    PendingReason::from_error(&e)
                }
            };
            if let Some(job) = self.state.lock().pending.get_mut(&request.job_id) {
                job.note(reason);
            }
        }
        started
    }

    /// A job ended. Returns its resources, then drops it from gang
    /// scheduling without a resume, which may resume jobs it displaced.
    pub fn job_finished(&self, job_id: JobId) -> bool {
        let released = self.selector.release(job_id);
        if let Some(gang) = &self.gang {
            gang.job_finished(job_id);
        }
        let mut state = self.state.lock();
        let was_running = state.running.remove(&job_id).is_some();
        state.changes += 1;
        tracing::info!(job_id, released, "Job finished");
        was_running || released
    }

    /// Mark jobs the gang scheduler had to force out as failed.
    pub fn reap_forced_removals(&self) -> Vec<ForcedRemoval> {
        let Some(gang) = &self.gang else {
            return Vec::new();
        };
        let mut reaped = Vec::new();
        for removal in gang.failed_jobs() {
            let newly_failed = {
                let mut state = self.state.lock();
                if state.failed.contains_key(&removal.job_id) {
                    false
                } else {
                    state.running.remove(&removal.job_id);
                    state.failed.insert(removal.job_id, removal.last_error.clone());
                    state.changes += 1;
                    true
                }
            };
            if newly_failed {
                self.selector.release(removal.job_id);
                tracing::error!(job_id = removal.job_id, error = %removal.last_error, "Job failed after preemption");
                reaped.push(removal);
            }
        }
        reaped
    }

    pub fn pending_reasons(&self, job_id: JobId) -> Vec<PendingReason> {
        self.state
            .lock()
            .pending
            .get(&job_id)
            .map(|p| p.reasons.clone())
            .unwrap_or_default()
    }

    pub fn pending_jobs(&self) -> Vec<JobId> {
        self.state.lock().pending.keys().copied().collect()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.state.lock().running.contains_key(&job_id)
    }

    /// Last error of a job removed after failed preemption.
    pub fn failure(&self, job_id: JobId) -> Option<SchedError> {
        self.state.lock().failed.get(&job_id).cloned()
    }

    /// Build the backfill view of the current queue at `now`.
    pub fn backfill_snapshot(&self, now: u64) -> BackfillSnapshot {
        let state = self.state.lock();
        let mut partitions: Vec<PartitionInfo> = state.partitions.values().cloned().collect();
        partitions.sort_by(|a, b| a.name.cmp(&b.name));
        BackfillSnapshot {
            now,
            state_version: state.changes.wrapping_add(self.ledger.version()),
            pending: state.pending.values().map(|p| p.request.clone()).collect(),
            partitions,
            usable: NodeSet::full(self.ledger.node_count()),
        }
    }

    /// Start the jobs a backfill plan chose, at their boosted priority,
    /// and annotate the ones it held back.
    pub fn apply_backfill(&self, plan: &BackfillPlan) {
        for (job_id, nodes, boosted_priority) in plan.starts() {
            let request = {
                let mut state = self.state.lock();
                let Some(job) = state.pending.get_mut(&job_id) else {
                    continue;
                };
                job.request.priority = boosted_priority;
                job.request.clone()
            };
            if let Err(e) = self.start_on(&request, nodes.clone(), plan.now) {
                tracing::warn!(job_id, error = %e, "Backfill start failed");
            }
        }

        let mut state = self.state.lock();
        for (job_id, decision) in &plan.decisions {
            if let BackfillDecision::Skipped { reason } = decision {
                if let Some(job) = state.pending.get_mut(job_id) {
                    job.note(*reason);
                }
            }
        }
    }
}

impl BackfillHost for JobScheduler {
    fn snapshot(&self) -> BackfillSnapshot {
        self.backfill_snapshot(current_time_secs())
    }

    fn apply(&self, plan: &BackfillPlan) {
        self.apply_backfill(plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consecutive_selector::ConsecutiveRunSelector;
    use crate::gang_scheduler::{RowState, SignalState};
    use crate::job_control::JobControl;
    use crate::node_table::NodeRecord;
    use hpc_common::config::{ConsumableResource, GangGranularity, SchedConfig, TaskDistribution};

    struct NoopControl;

    impl JobControl for NoopControl {
        fn suspend(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
        fn resume(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
        fn requeue(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
        fn checkpoint(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
        fn cancel(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
        fn kill(&self, _: JobId) -> SchedResult<()> {
            Ok(())
        }
    }

    fn scheduler(cpus: &[u16], gang: bool) -> JobScheduler {
        let nodes: Vec<NodeRecord> = cpus
            .iter()
            .enumerate()
            .map(|(i, c)| NodeRecord::new(format!("n{i}"), *c))
            .collect();
        let ledger = Arc::new(ResourceLedger::new(nodes.clone(), ConsumableResource::Cpu, false).unwrap());
        let selector = Arc::new(ConsecutiveRunSelector::new(ledger.clone(), TaskDistribution::Block, 600));
        let gang = gang.then(|| {
            let config = SchedConfig {
                gang_granularity: GangGranularity::Cpu,
                ..Default::default()
            };
            Arc::new(GangScheduler::new(&config, &nodes, Arc::new(NoopControl)))
        });
        let sched = JobScheduler::new(ledger, selector, gang);
        sched.add_partition(PartitionInfo::new("batch", 1, NodeSet::full(cpus.len())));
        sched
    }

    fn job(job_id: JobId, nodes: u32, procs: u32, priority: u32) -> JobRequest {
        let mut req = JobRequest::new(job_id, nodes, procs);
        req.partition = "batch".to_string();
        req.priority = priority;
        req
    }

    #[test]
    fn test_schedule_pending_in_priority_order() {
        let sched = scheduler(&[2, 2], false);
        sched.submit(job(1, 2, 4, 1));
        sched.submit(job(2, 1, 2, 5));
        let started = sched.schedule_pending(100);
        assert_eq!(started, vec![2]);
        assert_eq!(sched.pending_jobs(), vec![1]);
        assert_eq!(sched.pending_reasons(1), vec![PendingReason::Resources]);
        assert!(sched.is_running(2));

        assert!(sched.job_finished(2));
        assert_eq!(sched.schedule_pending(200), vec![1]);
        assert!(sched.pending_jobs().is_empty());
    }

    #[test]
    fn test_reasons_accumulate_once() {
        let sched = scheduler(&[1, 1, 1], false);
        let mut req = job(1, 3, 3, 1);
        req.contiguous = true;
        req.excluded_nodes = Some(NodeSet::from_indices(3, [1]));
        sched.submit(req);
        sched.schedule_pending(1);
        sched.schedule_pending(2);
        assert_eq!(sched.pending_reasons(1), vec![PendingReason::Resources]);
    }

    #[test]
    fn test_unknown_partition_is_lookup_failure() {
        let sched = scheduler(&[1], false);
        let mut req = job(1, 1, 1, 1);
        req.partition = "nope".to_string();
        assert!(sched.start_job(&req, 0).unwrap_err().is_lookup_failure());
    }

    #[test]
    fn test_start_registers_with_gang() {
        let sched = scheduler(&[4], true);
        let placement = sched.start_job(&job(1, 1, 2, 1), 10).unwrap();
        assert_eq!(placement.alloc_cpus, 2);
        let gang = sched.gang.as_ref().unwrap();
        let state = gang.job_state("batch", 1).unwrap();
        assert_eq!(state.row_state, RowState::Active);
        assert_eq!(state.sig_state, SignalState::Running);

        sched.job_finished(1);
        assert!(gang.job_state("batch", 1).is_none());
        assert_eq!(sched.ledger().available_cpus(0), 4);
    }

    #[test]
    fn test_preemptable_jobs_lowest_priority_first() {
        let sched = scheduler(&[4, 4], true);
        sched.add_partition(PartitionInfo::new("low", 0, NodeSet::full(2)));
        sched.add_partition(PartitionInfo::new("high", 10, NodeSet::full(2)));
        for (job_id, partition) in [(1, "batch"), (2, "low"), (3, "low"), (4, "high")] {
            let mut req = job(job_id, 1, 1, 1);
            req.partition = partition.to_string();
            sched.start_job(&req, 10).unwrap();
        }
        assert_eq!(sched.preemptable_for(&job(9, 1, 1, 1)), vec![3, 2, 1]);

        let mut high = job(9, 1, 1, 1);
        high.partition = "high".to_string();
        assert_eq!(sched.preemptable_for(&high), vec![3, 2, 1, 4]);
        assert!(scheduler(&[4], false).preemptable_for(&job(9, 1, 1, 1)).is_empty());
    }

    #[test]
    fn test_backfill_snapshot_tracks_changes() {
        let sched = scheduler(&[1, 1], false);
        let before = sched.backfill_snapshot(5).state_version;
        sched.submit(job(1, 1, 1, 1));
        let snap = sched.backfill_snapshot(5);
        assert_ne!(snap.state_version, before);
        assert_eq!(snap.pending.len(), 1);
        assert_eq!(snap.usable.count(), 2);
    }
}
