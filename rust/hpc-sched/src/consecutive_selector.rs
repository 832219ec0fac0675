// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Best-fit selection over runs of consecutive candidate nodes.
//!
//! The candidate set is split into maximal runs of consecutive indices.
//! Runs are then taken one at a time, each time picking, in order of
//! preference: the first run seen, a run holding a required node, the
//! first run that satisfies what is still needed, the sufficient run with
//! the least surplus, or else the largest insufficient run. Ties go to the
//! run encountered first, so results are reproducible for a given input.

use std::sync::Arc;

use hpc_common::config::TaskDistribution;
use hpc_common::constants::MAX_NODE_COUNT;
use hpc_common::{JobId, NodeSet, SchedError, SchedResult};

use crate::job_allocation::{distribute_tasks, JobAllocation};
use crate::node_table::JobRequest;
use crate::resource_ledger::{LedgerState, ResourceLedger};
use crate::selector::{NodeLimits, NodeSelector, Placement, SelectMode};

/// Selector-local record of one run of consecutive candidate nodes.
#[derive(Debug, Clone)]
struct ConsecutiveRun {
    start: usize,
    end: usize,
    /// Non-required nodes in the run.
    nodes: i64,
    cpus: i64,
    first_required: Option<usize>,
}

impl ConsecutiveRun {
    fn starting_at(index: usize) -> Self {
        Self {
            start: index,
            end: index,
            nodes: 0,
            cpus: 0,
            first_required: None,
        }
    }
}

/// Per-node capacity the selection is tested against.
struct CapacityView {
    cpus: Vec<u32>,
    memory: Vec<u64>,
    busy: NodeSet,
}

impl CapacityView {
    /// Capacity still free in the ledger.
    fn free(state: &LedgerState) -> Self {
        let n = state.node_count();
        Self {
            cpus: (0..n).map(|i| u32::from(state.available_cpus(i))).collect(),
            memory: (0..n).map(|i| state.available_memory(i)).collect(),
            busy: state.busy_nodes(),
        }
    }

    /// Capacity of an empty cluster.
    fn physical(state: &LedgerState) -> Self {
        Self {
            cpus: state.nodes().map(|n| u32::from(n.cpus)).collect(),
            memory: state.nodes().map(|n| n.real_memory_mb).collect(),
            busy: NodeSet::new(state.node_count()),
        }
    }

    /// Add an allocation's shares back as if the job had ended.
    fn return_allocation(&mut self, alloc: &JobAllocation, state: &LedgerState) {
        for share in &alloc.shares {
            let Some(node) = state.node(share.node_index) else {
                continue;
            };
            let i = share.node_index;
            if !alloc.suspended {
                self.cpus[i] = (self.cpus[i] + u32::from(share.cpus)).min(u32::from(node.cpus));
            }
            self.memory[i] = (self.memory[i] + share.memory_mb).min(node.real_memory_mb);
        }
    }
}

/// The linear consumable-resource node selector.
pub struct ConsecutiveRunSelector {
    ledger: Arc<ResourceLedger>,
    default_distribution: TaskDistribution,
    default_time_limit_secs: u64,
}

impl ConsecutiveRunSelector {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        default_distribution: TaskDistribution,
        default_time_limit_secs: u64,
    ) -> Self {
        Self {
            ledger,
            default_distribution,
            default_time_limit_secs,
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    fn run_now(
        &self,
        state: &mut LedgerState,
        request: &JobRequest,
        candidates: &NodeSet,
        limits: NodeLimits,
        now: u64,
    ) -> SchedResult<Placement> {
        let view = CapacityView::free(state);
        let (mut chosen, cpus) = usable_nodes(state, request, candidates, &view);
        pick_runs(request, &mut chosen, limits, &cpus)?;
        let alloc = self.build_allocation(state, request, chosen, &cpus, now)?;
        Ok(commit_placement(state, alloc, Vec::new()))
    }

    /// `run_now`, then, if that fails, take preemptable jobs off the ledger
    /// one at a time until the request fits. The jobs are put back before
    /// the new allocation is committed; when it overlaps any of them it is
    /// committed suspended.
    fn run_now_preempting(
        &self,
        state: &mut LedgerState,
        request: &JobRequest,
        candidates: &NodeSet,
        limits: NodeLimits,
        now: u64,
        preemptable: &[JobId],
    ) -> SchedResult<Placement> {
        let mut last_err = match self.run_now(state, request, candidates, limits, now) {
            Ok(placement) => return Ok(placement),
            Err(e) => e,
        };

        let mut yielded: Vec<JobId> = Vec::new();
        let mut found = None;
        for &job_id in preemptable {
            let running_here = state
                .allocation(job_id)
                .is_some_and(|a| !a.suspended && a.node_set.overlaps(candidates));
            if !running_here || state.suspend(job_id).is_err() {
                continue;
            }
            yielded.push(job_id);

            let mut view = CapacityView::free(state);
            view.busy = busy_excluding(state, &yielded);
            let (mut chosen, cpus) = usable_nodes(state, request, candidates, &view);
            match pick_runs(request, &mut chosen, limits, &cpus) {
                Ok(_) => {
                    found = Some(self.build_allocation(state, request, chosen, &cpus, now));
                    break;
                }
                Err(e) => last_err = e,
            }
        }

        for &job_id in &yielded {
            if let Err(e) = state.resume(job_id) {
                tracing::error!(job_id, error = %e, "Could not restore preemptable job");
            }
        }
        let Some(alloc) = found else {
            return Err(last_err);
        };
        let mut alloc = alloc?;
        let preempts: Vec<JobId> = yielded
            .into_iter()
            .filter(|id| {
                state
                    .allocation(*id)
                    .is_some_and(|a| a.node_set.overlaps(&alloc.node_set))
            })
            .collect();
        alloc.suspended = !preempts.is_empty();
        if alloc.suspended {
            tracing::info!(job_id = request.job_id, ?preempts, "Job held until preempted jobs yield");
        }
        Ok(commit_placement(state, alloc, preempts))
    }

    /// Lay tasks over `chosen` and build the allocation. Shares are sized
    /// against the ledger as it stands.
    fn build_allocation(
        &self,
        state: &LedgerState,
        request: &JobRequest,
        chosen: NodeSet,
        cpus: &[u32],
        now: u64,
    ) -> SchedResult<JobAllocation> {
        let cpt = u32::from(request.cpus_per_task.max(1));
        let indices: Vec<usize> = chosen.iter().collect();
        let task_capacity: Vec<u32> = indices.iter().map(|&i| cpus[i] / cpt).collect();
        let layout = request.distribution.unwrap_or(self.default_distribution);
        let tasks = distribute_tasks(&task_capacity, request.num_tasks(), layout);

        let mut shares = Vec::with_capacity(indices.len());
        let mut node_names = Vec::with_capacity(indices.len());
        for (k, &i) in indices.iter().enumerate() {
            let Some(node) = state.node(i) else {
                return Err(SchedError::lookup_failure(format!("node index {i} not in ledger")));
            };
            let share_cpus = if request.exclusive {
                u32::from(node.cpus)
            } else {
                (tasks[k] * cpt).min(cpus[i])
            };
            node_names.push(node.name.clone());
            shares.push(state.build_share(i, share_cpus as u16, request.memory_per_node_mb));
        }

        let time_limit = request.time_limit_secs.unwrap_or(self.default_time_limit_secs);
        Ok(JobAllocation {
            job_id: request.job_id,
            node_set: chosen,
            node_names,
            shares,
            suspended: false,
            start_time: now,
            end_time: now.saturating_add(time_limit),
        })
    }

    fn test_only(
        &self,
        state: &LedgerState,
        request: &JobRequest,
        candidates: &NodeSet,
        limits: NodeLimits,
        now: u64,
    ) -> SchedResult<Placement> {
        let view = CapacityView::physical(state);
        let (mut chosen, cpus) = usable_nodes(state, request, candidates, &view);
        let alloc_cpus = pick_runs(request, &mut chosen, limits, &cpus)?;
        Ok(Placement::now(chosen, now, alloc_cpus))
    }

    fn will_run(
        &self,
        state: &LedgerState,
        request: &JobRequest,
        candidates: &NodeSet,
        limits: NodeLimits,
        now: u64,
    ) -> SchedResult<Placement> {
        let mut view = CapacityView::free(state);
        let (mut chosen, cpus) = usable_nodes(state, request, candidates, &view);
        let mut last_err = match pick_runs(request, &mut chosen, limits, &cpus) {
            Ok(alloc_cpus) => return Ok(Placement::now(chosen, now, alloc_cpus)),
            Err(e) => e,
        };

        // Let running jobs end one at a time, earliest first.
        let mut running: Vec<&JobAllocation> = state.allocations().collect();
        running.sort_by_key(|a| (a.end_time, a.job_id));
        for (k, alloc) in running.iter().enumerate() {
            view.return_allocation(alloc, state);
            let mut busy = NodeSet::new(state.node_count());
            for later in &running[k + 1..] {
                busy.union_with(&later.node_set);
            }
            view.busy = busy;

            let (mut chosen, cpus) = usable_nodes(state, request, candidates, &view);
            match pick_runs(request, &mut chosen, limits, &cpus) {
                Ok(alloc_cpus) => {
                    return Ok(Placement::now(chosen, alloc.end_time.max(now), alloc_cpus));
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl ConsecutiveRunSelector {
    /// Run `f` under the ledger lock, narrowing `candidates` on success.
    fn locked(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        mode: SelectMode,
        f: impl FnOnce(&mut LedgerState, &NodeSet) -> SchedResult<Placement>,
    ) -> SchedResult<Placement> {
        self.ledger.with_state(|state| {
            if candidates.size() != state.node_count() {
                return Err(SchedError::invalid_argument(format!(
                    "candidate set covers {} nodes, ledger has {}",
                    candidates.size(),
                    state.node_count()
                )));
            }
            let result = f(state, &*candidates);
            match &result {
                Ok(placement) => *candidates = placement.nodes.clone(),
                Err(e) => tracing::debug!(job_id = request.job_id, ?mode, error = %e, "Node selection failed"),
            }
            result
        })
    }
}

impl NodeSelector for ConsecutiveRunSelector {
    fn select(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        limits: NodeLimits,
        mode: SelectMode,
        now: u64,
    ) -> SchedResult<Placement> {
        self.locked(request, candidates, mode, |state, candidates| match mode {
            SelectMode::RunNow => self.run_now(state, request, candidates, limits, now),
            SelectMode::TestOnly => self.test_only(state, request, candidates, limits, now),
            SelectMode::WillRun => self.will_run(state, request, candidates, limits, now),
        })
    }

    fn select_preempting(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        limits: NodeLimits,
        now: u64,
        preemptable: &[JobId],
    ) -> SchedResult<Placement> {
        self.locked(request, candidates, SelectMode::RunNow, |state, candidates| {
            self.run_now_preempting(state, request, candidates, limits, now, preemptable)
        })
    }

    fn release(&self, job_id: JobId) -> bool {
        self.ledger.release(job_id)
    }
}

fn commit_placement(state: &mut LedgerState, alloc: JobAllocation, preempts: Vec<JobId>) -> Placement {
    let placement = Placement {
        nodes: alloc.node_set.clone(),
        start_time: alloc.start_time,
        alloc_cpus: alloc.total_cpus(),
        shares: alloc.shares.clone(),
        deferred: false,
        preempts,
    };
    state.commit(alloc);
    placement
}

/// Nodes carrying an allocation of any job outside `skip`.
fn busy_excluding(state: &LedgerState, skip: &[JobId]) -> NodeSet {
    let mut busy = NodeSet::new(state.node_count());
    for alloc in state.allocations().filter(|a| !skip.contains(&a.job_id)) {
        busy.union_with(&alloc.node_set);
    }
    busy
}

/// Usable CPUs on one node for this request: rounded down to whole tasks
/// and capped by the per-node task limit.
fn usable_cpus(raw: u32, request: &JobRequest) -> u32 {
    let cpt = u32::from(request.cpus_per_task.max(1));
    let mut cpus = raw / cpt * cpt;
    if request.ntasks_per_node > 0 {
        cpus = cpus.min(u32::from(request.ntasks_per_node) * cpt);
    }
    cpus
}

/// Filter candidates down to nodes this request could use under `view`.
/// Returns the filtered set and per-node usable CPUs over the whole
/// universe (zero outside the set).
fn usable_nodes(
    state: &LedgerState,
    request: &JobRequest,
    candidates: &NodeSet,
    view: &CapacityView,
) -> (NodeSet, Vec<u32>) {
    let mut usable = candidates.clone();
    if let Some(excluded) = &request.excluded_nodes {
        usable.subtract(excluded);
    }
    if request.exclusive {
        usable.subtract(&view.busy);
    }

    let check_memory = state.track_memory() && request.memory_per_node_mb > 0;
    let mut cpus = vec![0u32; candidates.size()];
    let members: Vec<usize> = usable.iter().collect();
    for i in members {
        let avail = view.cpus.get(i).map(|c| usable_cpus(*c, request)).unwrap_or(0);
        let memory_short = check_memory
            && view.memory.get(i).copied().unwrap_or(0) < request.memory_per_node_mb;
        if avail == 0 || memory_short {
            usable.remove(i);
        } else {
            cpus[i] = avail;
        }
    }
    (usable, cpus)
}

/// Whether `avail` more nodes cover what is still needed. When a preferred
/// count above the minimum is set, only the minimum is mandatory.
fn enough_nodes(avail: i64, rem: i64, min: i64, req: i64) -> bool {
    let needed = if req > min { rem + min - req } else { rem };
    avail >= needed
}

/// Narrow `bitmap` to a best-fit choice of nodes. Returns the CPUs the
/// chosen nodes offer.
fn pick_runs(
    request: &JobRequest,
    bitmap: &mut NodeSet,
    limits: NodeLimits,
    cpus: &[u32],
) -> SchedResult<u32> {
    let min_nodes = i64::from(limits.min);
    let req_nodes = i64::from(limits.req);
    let mut max_nodes = if limits.max == 0 {
        MAX_NODE_COUNT as i64
    } else {
        i64::from(limits.max)
    };

    if (bitmap.count() as i64) < min_nodes {
        return Err(SchedError::infeasible(format!(
            "{} usable nodes, {} required",
            bitmap.count(),
            min_nodes
        )));
    }
    let required = request.required_nodes.as_ref();
    if let Some(required) = required {
        if !required.is_subset_of(bitmap) {
            return Err(SchedError::infeasible("required nodes unavailable"));
        }
    }

    let mut rem_cpus = i64::from(request.num_procs);
    let mut rem_nodes = req_nodes.max(min_nodes);
    let mut alloc_cpus: i64 = 0;

    // Required nodes are taken up front; everything else is cleared and
    // grouped into runs.
    let mut runs: Vec<ConsecutiveRun> = Vec::new();
    let mut current: Option<ConsecutiveRun> = None;
    for index in 0..bitmap.size() {
        if bitmap.contains(index) {
            let run = current.get_or_insert_with(|| ConsecutiveRun::starting_at(index));
            let avail = i64::from(cpus.get(index).copied().unwrap_or(0));
            if required.is_some_and(|r| r.contains(index)) && max_nodes > 0 {
                if run.first_required.is_none() {
                    run.first_required = Some(index);
                }
                rem_cpus -= avail;
                alloc_cpus += avail;
                rem_nodes -= 1;
                max_nodes -= 1;
            } else {
                bitmap.remove(index);
                run.cpus += avail;
                run.nodes += 1;
            }
            run.end = index;
        } else if let Some(run) = current.take() {
            if run.nodes > 0 {
                runs.push(run);
            }
        }
    }
    if let Some(run) = current.take() {
        if run.nodes > 0 {
            runs.push(run);
        }
    }

    let mut success = false;
    let mut contiguity_failed = false;
    while !runs.is_empty() && max_nodes > 0 {
        let mut best: Option<usize> = None;
        let mut best_cpus = 0i64;
        let mut best_nodes = 0i64;
        let mut best_required = false;
        let mut best_sufficient = false;

        for (i, run) in runs.iter().enumerate() {
            if run.nodes == 0 {
                continue;
            }
            let sufficient = run.cpus >= rem_cpus && enough_nodes(run.nodes, rem_nodes, min_nodes, req_nodes);
            if best_nodes == 0
                || (!best_required && run.first_required.is_some())
                || (sufficient && !best_sufficient)
                || (sufficient && run.cpus < best_cpus)
                || (!sufficient && run.cpus > best_cpus)
            {
                best = Some(i);
                best_cpus = run.cpus;
                best_nodes = run.nodes;
                best_required = run.first_required.is_some();
                best_sufficient = sufficient;
            }
        }
        let Some(best) = best else {
            break;
        };

        if request.contiguous
            && (best_cpus < rem_cpus || !enough_nodes(best_nodes, rem_nodes, min_nodes, req_nodes))
        {
            // No single run can hold the job.
            contiguity_failed = true;
            break;
        }

        let run = runs[best].clone();
        let mut take = |i: usize, bitmap: &mut NodeSet| -> bool {
            if max_nodes <= 0 || (rem_nodes <= 0 && rem_cpus <= 0) {
                return false;
            }
            if !bitmap.contains(i) {
                bitmap.insert(i);
                let avail = i64::from(cpus.get(i).copied().unwrap_or(0));
                rem_nodes -= 1;
                max_nodes -= 1;
                rem_cpus -= avail;
                alloc_cpus += avail;
            }
            true
        };
        match run.first_required {
            Some(first_required) => {
                // Outward from the required node: forward, then backward.
                for i in first_required..=run.end {
                    if !take(i, bitmap) {
                        break;
                    }
                }
                for i in (run.start..first_required).rev() {
                    if !take(i, bitmap) {
                        break;
                    }
                }
            }
            None => {
                for i in run.start..=run.end {
                    if !take(i, bitmap) {
                        break;
                    }
                }
            }
        }

        if request.contiguous || (rem_nodes <= 0 && rem_cpus <= 0) {
            success = true;
            break;
        }
        runs[best].cpus = 0;
        runs[best].nodes = 0;
    }

    if !success && rem_cpus <= 0 && enough_nodes(0, rem_nodes, min_nodes, req_nodes) {
        success = true;
    }
    if !success {
        return Err(if request.contiguous || contiguity_failed {
            SchedError::no_contiguous_hole(format!(
                "no run of consecutive nodes holds {} nodes / {} cpus",
                min_nodes, request.num_procs
            ))
        } else {
            SchedError::infeasible(format!(
                "{} cpus and {} nodes still needed",
                rem_cpus.max(0),
                rem_nodes.max(0)
            ))
        });
    }
    if !limits.admits(bitmap.count() as u32) {
        return Err(SchedError::infeasible(format!(
            "{} nodes chosen, outside limits {}..{}",
            bitmap.count(),
            limits.min,
            limits.max
        )));
    }
    Ok(alloc_cpus.max(0) as u32)
}
