// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Gang scheduler: per-partition active rows and timeslice rotation.
//!
//! Every partition keeps an ordered job list and an "active row": the
//! resource usage of the jobs allowed to run right now. Jobs outside the
//! row are suspended. Running jobs of higher-priority partitions cast
//! shadows: their footprints are placed into the row of every
//! lower-priority partition before any of that partition's own jobs, so
//! conflicting lower-priority jobs are preempted.
//!
//! Shadows are derived from the current signal states every time a row
//! is rebuilt. Rows are rebuilt in descending partition priority so
//! shadow changes are visible before lower partitions rebuild.
//!
//! Signals are never delivered with the gang lock held: they are queued
//! while the state is updated and dispatched afterwards, every suspend
//! ahead of any resume.
//!
//! With preemption off the rows are still built, but jobs left out of a
//! row keep running and no signal is sent.

use std::sync::Arc;
use std::time::Duration;

use hpc_common::config::{GangGranularity, PreemptMode, SchedConfig};
use hpc_common::{JobId, NodeSet, SchedError, SchedResult};
use parking_lot::Mutex;

use crate::job_allocation::NodeShare;
use crate::job_control::{Escalator, ForcedRemoval, JobControl, SignalOp};
use crate::node_table::NodeRecord;
use crate::periodic_loop::PeriodicLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowState {
    Active,
    /// In the row by fitting into space left by active jobs.
    Filler,
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalState {
    Running,
    Suspended,
}

/// The resources a job holds, at the gang granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    pub nodes: NodeSet,
    /// Per node index: a socket bitmask for socket granularity, a core or
    /// CPU count for core/cpu granularity, unused for node granularity.
    pub units: Vec<u32>,
}

impl Footprint {
    /// Whole-node footprint.
    pub fn whole_nodes(nodes: NodeSet) -> Self {
        let units = vec![0; nodes.size()];
        Self { nodes, units }
    }

    /// Footprint with explicit per-node units.
    pub fn with_units(nodes: NodeSet, units: Vec<u32>) -> Self {
        Self { nodes, units }
    }

    /// Derive a footprint from committed shares.
    pub fn from_shares(universe: usize, shares: &[NodeShare], granularity: GangGranularity) -> Self {
        let mut nodes = NodeSet::new(universe);
        let mut units = vec![0u32; universe];
        for share in shares {
            if share.node_index >= universe {
                continue;
            }
            nodes.insert(share.node_index);
            units[share.node_index] = match granularity {
                GangGranularity::Node => 0,
                GangGranularity::Socket => {
                    let mask = share
                        .cores
                        .iter()
                        .enumerate()
                        .filter(|(_, &c)| c > 0)
                        .fold(0u32, |m, (s, _)| m | (1u32 << (s % 32)));
                    if mask == 0 {
                        u32::MAX
                    } else {
                        mask
                    }
                }
                GangGranularity::Core => u32::from(share.total_cores()),
                GangGranularity::Cpu => u32::from(share.cpus),
            };
        }
        Self { nodes, units }
    }
}

#[derive(Debug, Clone)]
struct RowUsage {
    nodes: NodeSet,
    units: Vec<u32>,
}

impl RowUsage {
    fn new(universe: usize) -> Self {
        Self {
            nodes: NodeSet::new(universe),
            units: vec![0; universe],
        }
    }
}

/// Conflict rules for one granularity.
struct RowPolicy {
    granularity: GangGranularity,
    /// Per-node unit capacity for core/cpu granularity.
    capacity: Vec<u32>,
    preempt: bool,
    universe: usize,
}

impl RowPolicy {
    fn fits(&self, row: &RowUsage, fp: &Footprint) -> bool {
        match self.granularity {
            GangGranularity::Node => !row.nodes.overlaps(&fp.nodes),
            GangGranularity::Socket => fp.nodes.iter().all(|i| {
                !row.nodes.contains(i) || row.units[i] & unit(fp, i) == 0
            }),
            GangGranularity::Core | GangGranularity::Cpu => fp.nodes.iter().all(|i| {
                let cap = self.capacity.get(i).copied().unwrap_or(0);
                row.units[i].saturating_add(unit(fp, i)) <= cap
            }),
        }
    }

    fn add(&self, row: &mut RowUsage, fp: &Footprint) {
        row.nodes.union_with(&fp.nodes);
        for i in fp.nodes.iter() {
            if i >= row.units.len() {
                continue;
            }
            row.units[i] = match self.granularity {
                GangGranularity::Node => 0,
                GangGranularity::Socket => row.units[i] | unit(fp, i),
                GangGranularity::Core | GangGranularity::Cpu => row.units[i].saturating_add(unit(fp, i)),
            };
        }
    }
}

fn unit(fp: &Footprint, i: usize) -> u32 {
    fp.units.get(i).copied().unwrap_or(0)
}

#[derive(Debug, Clone)]
struct GangJob {
    job_id: JobId,
    footprint: Footprint,
    row_state: RowState,
    sig_state: SignalState,
}

struct GangPartition {
    name: String,
    priority: u32,
    jobs: Vec<GangJob>,
    row: RowUsage,
    jobs_active: usize,
}

impl GangPartition {
    fn needs_cycle(&self) -> bool {
        self.jobs_active < self.jobs.len()
    }

    fn position(&self, job_id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.job_id == job_id)
    }
}

/// A signal queued under the lock, delivered after it is released.
#[derive(Debug, Clone)]
struct PendingSignal {
    partition: String,
    job_id: JobId,
    op: SignalOp,
}

struct GangState {
    /// Sorted by descending priority, then name.
    partitions: Vec<GangPartition>,
    policy: RowPolicy,
}

impl GangState {
    fn index_of(&self, name: &str) -> SchedResult<usize> {
        self.partitions
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SchedError::lookup_failure(format!("partition {name} not gang scheduled")))
    }

    fn sort_partitions(&mut self) {
        self.partitions
            .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    }

    /// Running jobs of every strictly higher-priority partition.
    fn shadows(&self, idx: usize) -> Vec<(JobId, Footprint)> {
        let priority = self.partitions[idx].priority;
        self.partitions
            .iter()
            .filter(|p| p.priority > priority)
            .flat_map(|p| p.jobs.iter())
            .filter(|j| j.sig_state == SignalState::Running)
            .map(|j| (j.job_id, j.footprint.clone()))
            .collect()
    }

    /// Rebuild a row keeping current ACTIVE then FILLER jobs, then, when
    /// `add_new_jobs`, admitting the rest as FILLER where they fit.
    fn update_active_row(&mut self, idx: usize, add_new_jobs: bool, signals: &mut Vec<PendingSignal>) {
        let shadows = self.shadows(idx);
        let policy = &self.policy;
        let part = &mut self.partitions[idx];

        part.row = RowUsage::new(policy.universe);
        for (_, fp) in &shadows {
            policy.add(&mut part.row, fp);
        }

        for state in [RowState::Active, RowState::Filler] {
            for job in part.jobs.iter_mut().filter(|j| j.row_state == state) {
                if policy.fits(&part.row, &job.footprint) {
                    policy.add(&mut part.row, &job.footprint);
                } else {
                    job.row_state = RowState::NotActive;
                }
            }
        }
        if add_new_jobs {
            for job in part.jobs.iter_mut().filter(|j| j.row_state == RowState::NotActive) {
                if policy.fits(&part.row, &job.footprint) {
                    policy.add(&mut part.row, &job.footprint);
                    job.row_state = RowState::Filler;
                }
            }
        }

        // A row without active jobs is owned by its fillers.
        if !part.jobs.iter().any(|j| j.row_state == RowState::Active) {
            for job in part.jobs.iter_mut().filter(|j| j.row_state == RowState::Filler) {
                job.row_state = RowState::Active;
            }
        }
        reconcile(part, policy.preempt, signals);
    }

    /// Rotate ACTIVE jobs to the back and rebuild the row from scratch.
    fn cycle(&mut self, idx: usize, signals: &mut Vec<PendingSignal>) {
        let shadows = self.shadows(idx);
        let policy = &self.policy;
        let part = &mut self.partitions[idx];

        let (active, rest): (Vec<GangJob>, Vec<GangJob>) =
            part.jobs.drain(..).partition(|j| j.row_state == RowState::Active);
        part.jobs = rest;
        part.jobs.extend(active);

        part.row = RowUsage::new(policy.universe);
        for (_, fp) in &shadows {
            policy.add(&mut part.row, fp);
        }
        for job in part.jobs.iter_mut() {
            if policy.fits(&part.row, &job.footprint) {
                policy.add(&mut part.row, &job.footprint);
                job.row_state = RowState::Active;
            } else {
                job.row_state = RowState::NotActive;
            }
        }
        tracing::debug!(
            partition = %part.name,
            order = ?part.jobs.iter().map(|j| j.job_id).collect::<Vec<_>>(),
            "Cycled timeslice"
        );
        reconcile(part, policy.preempt, signals);
    }

    /// Rebuild every row in priority order.
    fn update_all(&mut self, signals: &mut Vec<PendingSignal>) {
        for idx in 0..self.partitions.len() {
            self.update_active_row(idx, true, signals);
        }
    }

    fn remove_job(&mut self, idx: usize, job_id: JobId, fini: bool, signals: &mut Vec<PendingSignal>) -> bool {
        let part = &mut self.partitions[idx];
        let Some(pos) = part.position(job_id) else {
            return false;
        };
        let job = part.jobs.remove(pos);
        if job.sig_state == SignalState::Suspended && !fini {
            signals.push(PendingSignal {
                partition: part.name.clone(),
                job_id,
                op: SignalOp::Resume,
            });
        }
        tracing::debug!(job_id, partition = %part.name, fini, "Removed job from gang partition");
        self.update_all(signals);
        true
    }
}

/// Suspend running jobs outside the row; resume suspended jobs inside it.
/// Without preemption only resumes are sent.
fn reconcile(part: &mut GangPartition, preempt: bool, signals: &mut Vec<PendingSignal>) {
    for job in part.jobs.iter_mut() {
        let in_row = job.row_state != RowState::NotActive;
        match (in_row, job.sig_state) {
            (false, SignalState::Running) if preempt => {
                job.sig_state = SignalState::Suspended;
                signals.push(PendingSignal {
                    partition: part.name.clone(),
                    job_id: job.job_id,
                    op: SignalOp::Suspend,
                });
            }
            (true, SignalState::Suspended) => {
                job.sig_state = SignalState::Running;
                signals.push(PendingSignal {
                    partition: part.name.clone(),
                    job_id: job.job_id,
                    op: SignalOp::Resume,
                });
            }
            _ => {}
        }
    }
    part.jobs_active = part
        .jobs
        .iter()
        .filter(|j| j.row_state != RowState::NotActive)
        .count();
}

/// Snapshot of one job's gang state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GangJobState {
    pub job_id: JobId,
    pub row_state: RowState,
    pub sig_state: SignalState,
}

pub struct GangScheduler {
    state: Mutex<GangState>,
    escalator: Escalator,
    preempt_mode: PreemptMode,
    time_slice: Duration,
    shutdown_grace: Duration,
}

impl GangScheduler {
    pub fn new(config: &SchedConfig, nodes: &[NodeRecord], control: Arc<dyn JobControl>) -> Self {
        let granularity = config.gang_granularity;
        let capacity = nodes
            .iter()
            .map(|n| match granularity {
                GangGranularity::Core => u32::from(n.total_cores()),
                _ => u32::from(n.cpus),
            })
            .collect();
        Self {
            state: Mutex::new(GangState {
                partitions: Vec::new(),
                policy: RowPolicy {
                    granularity,
                    capacity,
                    preempt: config.preempt_mode != PreemptMode::Off,
                    universe: nodes.len(),
                },
            }),
            escalator: Escalator::new(control, config.signal_retry_limit),
            preempt_mode: config.preempt_mode,
            time_slice: Duration::from_millis(config.gang_time_slice_ms),
            shutdown_grace: Duration::from_millis(config.loop_shutdown_grace_ms),
        }
    }

    pub fn granularity(&self) -> GangGranularity {
        self.state.lock().policy.granularity
    }

    /// Whether jobs outside a row are suspended.
    pub fn preempts(&self) -> bool {
        self.preempt_mode != PreemptMode::Off
    }

    pub fn add_partition(&self, name: impl Into<String>, priority: u32) {
        let name = name.into();
        let mut state = self.state.lock();
        if state.index_of(&name).is_ok() {
            return;
        }
        let universe = state.policy.universe;
        tracing::info!(partition = %name, priority, "Gang scheduling partition");
        state.partitions.push(GangPartition {
            name,
            priority,
            jobs: Vec::new(),
            row: RowUsage::new(universe),
            jobs_active: 0,
        });
        state.sort_partitions();
    }

    /// Drop a partition. Its suspended jobs are resumed.
    pub fn remove_partition(&self, name: &str) -> SchedResult<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            let idx = state.index_of(name)?;
            let part = state.partitions.remove(idx);
            for job in &part.jobs {
                if job.sig_state == SignalState::Suspended {
                    signals.push(PendingSignal {
                        partition: part.name.clone(),
                        job_id: job.job_id,
                        op: SignalOp::Resume,
                    });
                }
            }
            tracing::info!(partition = %name, jobs = part.jobs.len(), "Removed gang partition");
            state.update_all(&mut signals);
        }
        self.dispatch(signals);
        Ok(())
    }

    /// Register a job that just started running in `partition`.
    pub fn add_job(&self, partition: &str, job_id: JobId, footprint: Footprint) -> SchedResult<()> {
        self.insert_job(partition, job_id, footprint, SignalState::Running)
    }

    /// Register a job committed suspended on resources other jobs still
    /// hold. It is resumed once its row admits it.
    pub fn add_held_job(&self, partition: &str, job_id: JobId, footprint: Footprint) -> SchedResult<()> {
        self.insert_job(partition, job_id, footprint, SignalState::Suspended)
    }

    fn insert_job(
        &self,
        partition: &str,
        job_id: JobId,
        footprint: Footprint,
        sig_state: SignalState,
    ) -> SchedResult<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            let idx = state.index_of(partition)?;
            if state.partitions[idx].position(job_id).is_some() {
                tracing::debug!(job_id, partition, "Job already gang scheduled");
                return Ok(());
            }
            let fits = state.policy.fits(&state.partitions[idx].row, &footprint);
            let row_state = if fits {
                RowState::Filler
            } else {
                RowState::NotActive
            };
            let part = &mut state.partitions[idx];
            part.jobs.push(GangJob {
                job_id,
                footprint,
                row_state,
                sig_state,
            });
            tracing::debug!(job_id, partition, ?row_state, ?sig_state, "Added job to gang partition");
            state.update_all(&mut signals);
        }
        self.dispatch(signals);
        Ok(())
    }

    /// Remove a job from `partition`. With `fini` the job has ended and is
    /// not resumed even if suspended.
    pub fn remove_job(&self, partition: &str, job_id: JobId, fini: bool) -> SchedResult<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            let idx = state.index_of(partition)?;
            if !state.remove_job(idx, job_id, fini, &mut signals) {
                return Err(SchedError::lookup_failure(format!(
                    "job {job_id} not in gang partition {partition}"
                )));
            }
        }
        self.dispatch(signals);
        Ok(())
    }

    /// A job completed; drop it from whichever partition holds it.
    pub fn job_finished(&self, job_id: JobId) -> bool {
        let mut signals = Vec::new();
        let removed = {
            let mut state = self.state.lock();
            let found = state
                .partitions
                .iter()
                .position(|p| p.position(job_id).is_some());
            match found {
                Some(idx) => state.remove_job(idx, job_id, true, &mut signals),
                None => false,
            }
        };
        self.dispatch(signals);
        removed
    }

    /// Rotate one partition's timeslice, then refresh the rows below it.
    pub fn cycle_timeslice(&self, partition: &str) -> SchedResult<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            let idx = state.index_of(partition)?;
            state.cycle(idx, &mut signals);
            for lower in idx + 1..state.partitions.len() {
                state.update_active_row(lower, true, &mut signals);
            }
        }
        self.dispatch(signals);
        Ok(())
    }

    /// One timeslicer pass: every partition in descending priority, cycling
    /// those with jobs outside their row.
    pub fn run_cycle(&self) {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            for idx in 0..state.partitions.len() {
                if state.policy.preempt && state.partitions[idx].needs_cycle() {
                    state.cycle(idx, &mut signals);
                } else {
                    state.update_active_row(idx, true, &mut signals);
                }
            }
        }
        self.dispatch(signals);
    }

    /// Spawn the timeslicer loop.
    pub fn spawn_timeslicer(self: &Arc<Self>) -> PeriodicLoop {
        let this = Arc::clone(self);
        PeriodicLoop::spawn("gang-timeslicer", self.time_slice, move || this.run_cycle())
            .with_shutdown_grace(self.shutdown_grace)
    }

    pub fn job_state(&self, partition: &str, job_id: JobId) -> Option<GangJobState> {
        let state = self.state.lock();
        let idx = state.index_of(partition).ok()?;
        state.partitions[idx]
            .jobs
            .iter()
            .find(|j| j.job_id == job_id)
            .map(|j| GangJobState {
                job_id,
                row_state: j.row_state,
                sig_state: j.sig_state,
            })
    }

    /// Jobs of a partition in timeslice order.
    pub fn jobs(&self, partition: &str) -> Vec<GangJobState> {
        let state = self.state.lock();
        let Ok(idx) = state.index_of(partition) else {
            return Vec::new();
        };
        state.partitions[idx]
            .jobs
            .iter()
            .map(|j| GangJobState {
                job_id: j.job_id,
                row_state: j.row_state,
                sig_state: j.sig_state,
            })
            .collect()
    }

    /// Jobs of higher-priority partitions currently shadowing `partition`.
    pub fn shadow_jobs(&self, partition: &str) -> Vec<JobId> {
        let state = self.state.lock();
        match state.index_of(partition) {
            Ok(idx) => state.shadows(idx).into_iter().map(|(id, _)| id).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Partition names in the order rows are rebuilt.
    pub fn partitions(&self) -> Vec<String> {
        self.state.lock().partitions.iter().map(|p| p.name.clone()).collect()
    }

    pub fn failed_jobs(&self) -> Vec<ForcedRemoval> {
        self.escalator.forced_removals()
    }

    /// Deliver queued signals. Jobs that leave their partition because
    /// preemption escalated past suspend are removed, which may queue more.
    fn dispatch(&self, mut signals: Vec<PendingSignal>) {
        while !signals.is_empty() {
            // Resources must be given up before anyone is resumed onto them.
            signals.sort_by_key(|s| s.op == SignalOp::Resume);
            let mut departed = Vec::new();
            for signal in signals.drain(..) {
                match signal.op {
                    SignalOp::Suspend => {
                        tracing::info!(job_id = signal.job_id, partition = %signal.partition, "Suspending job");
                        let outcome = self.escalator.preempt(signal.job_id, self.preempt_mode);
                        if outcome.job_left() {
                            departed.push(signal);
                        }
                    }
                    SignalOp::Resume => {
                        tracing::info!(job_id = signal.job_id, partition = %signal.partition, "Resuming job");
                        self.escalator.resume(signal.job_id);
                    }
                    other => {
                        tracing::warn!(job_id = signal.job_id, op = %other, "Unexpected gang signal");
                    }
                }
            }

            if departed.is_empty() {
                break;
            }
            let mut state = self.state.lock();
            for signal in departed {
                if let Ok(idx) = state.index_of(&signal.partition) {
                    state.remove_job(idx, signal.job_id, true, &mut signals);
                }
            }
        }
    }
}
