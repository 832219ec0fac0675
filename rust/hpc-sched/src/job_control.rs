// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job-control collaborator and the preemption escalation chain.

use std::fmt;
use std::sync::Arc;

use hpc_common::config::PreemptMode;
use hpc_common::{JobId, SchedError, SchedResult};
use parking_lot::Mutex;

use crate::resource_ledger::ResourceLedger;

/// Signals delivered to running jobs. Implemented by the daemon layer.
pub trait JobControl: Send + Sync {
    fn suspend(&self, job_id: JobId) -> SchedResult<()>;
    fn resume(&self, job_id: JobId) -> SchedResult<()>;
    fn requeue(&self, job_id: JobId) -> SchedResult<()>;
    fn checkpoint(&self, job_id: JobId) -> SchedResult<()>;
    fn cancel(&self, job_id: JobId) -> SchedResult<()>;
    fn kill(&self, job_id: JobId) -> SchedResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalOp {
    Suspend,
    Resume,
    Requeue,
    Checkpoint,
    Cancel,
    Kill,
}

impl SignalOp {
    pub fn apply(&self, control: &dyn JobControl, job_id: JobId) -> SchedResult<()> {
        match self {
            Self::Suspend => control.suspend(job_id),
            Self::Resume => control.resume(job_id),
            Self::Requeue => control.requeue(job_id),
            Self::Checkpoint => control.checkpoint(job_id),
            Self::Cancel => control.cancel(job_id),
            Self::Kill => control.kill(job_id),
        }
    }

    /// Whether the job stays resident after this op succeeds.
    pub fn keeps_job(&self) -> bool {
        matches!(self, Self::Suspend | Self::Resume)
    }
}

impl fmt::Display for SignalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The escalation steps for a preemption mode, first step first.
pub fn escalation_chain(mode: PreemptMode) -> &'static [SignalOp] {
    use SignalOp::*;
    static CHAIN: [SignalOp; 5] = [Suspend, Requeue, Checkpoint, Cancel, Kill];
    match mode {
        PreemptMode::Off => &[],
        PreemptMode::Suspend => &CHAIN,
        PreemptMode::Requeue => &CHAIN[1..],
        PreemptMode::Checkpoint => &CHAIN[2..],
        PreemptMode::Cancel => &CHAIN[3..],
    }
}

/// A job removed because every gentler step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedRemoval {
    pub job_id: JobId,
    /// Whether the final kill went through.
    pub killed: bool,
    pub last_error: SchedError,
}

/// Result of preempting one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptOutcome {
    pub job_id: JobId,
    /// The step that succeeded, if any.
    pub applied: Option<SignalOp>,
}

impl PreemptOutcome {
    /// The job is gone from its partition (requeued, vacated, or removed).
    pub fn job_left(&self) -> bool {
        !matches!(self.applied, Some(SignalOp::Suspend))
    }
}

/// Runs the escalation chain against a job-control collaborator.
pub struct Escalator {
    control: Arc<dyn JobControl>,
    suspend_retries: u32,
    removed: Mutex<Vec<ForcedRemoval>>,
}

impl Escalator {
    pub fn new(control: Arc<dyn JobControl>, suspend_retries: u32) -> Self {
        Self {
            control,
            suspend_retries,
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn control(&self) -> &Arc<dyn JobControl> {
        &self.control
    }

    /// Preempt `job_id`, escalating through the chain for `mode` until a
    /// step succeeds. Never called with the gang lock held.
    pub fn preempt(&self, job_id: JobId, mode: PreemptMode) -> PreemptOutcome {
        let mut last_error = None;
        for op in escalation_chain(mode) {
            let attempts = if *op == SignalOp::Suspend {
                1 + self.suspend_retries
            } else {
                1
            };
            for attempt in 1..=attempts {
                match op.apply(self.control.as_ref(), job_id) {
                    Ok(()) => {
                        if *op == SignalOp::Kill {
                            tracing::error!(job_id, "Job forcibly killed after failed preemption");
                            self.removed.lock().push(ForcedRemoval {
                                job_id,
                                killed: true,
                                last_error: last_error.unwrap_or_else(|| {
                                    SchedError::signal_failure("preemption escalated to kill")
                                }),
                            });
                        } else {
                            tracing::info!(job_id, %op, "Preempted job");
                        }
                        return PreemptOutcome {
                            job_id,
                            applied: Some(*op),
                        };
                    }
                    Err(e) => {
                        tracing::warn!(job_id, %op, attempt, error = %e, "Preemption step failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        if let Some(last_error) = last_error {
            tracing::error!(job_id, error = %last_error, "Every preemption step failed");
            self.removed.lock().push(ForcedRemoval {
                job_id,
                killed: false,
                last_error,
            });
        }
        PreemptOutcome {
            job_id,
            applied: None,
        }
    }

    /// Resume a suspended job. Failures are logged and not escalated.
    pub fn resume(&self, job_id: JobId) -> bool {
        match self.control.resume(job_id) {
            Ok(()) => {
                tracing::info!(job_id, "Resumed job");
                true
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to resume job");
                false
            }
        }
    }

    /// Jobs forcibly removed so far, oldest first.
    pub fn forced_removals(&self) -> Vec<ForcedRemoval> {
        self.removed.lock().clone()
    }
}

/// Keeps the ledger in step with job-control outcomes: suspend and resume
/// move the compute dimension, terminal ops release the allocation.
pub struct LedgerJobControl {
    inner: Arc<dyn JobControl>,
    ledger: Arc<ResourceLedger>,
}

impl LedgerJobControl {
    pub fn new(inner: Arc<dyn JobControl>, ledger: Arc<ResourceLedger>) -> Self {
        Self { inner, ledger }
    }

    fn release(&self, job_id: JobId) {
        self.ledger.release(job_id);
    }
}

impl JobControl for LedgerJobControl {
    fn suspend(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.suspend(job_id)?;
        if let Err(e) = self.ledger.suspend(job_id) {
            tracing::warn!(job_id, error = %e, "Suspended job has no ledger allocation");
        }
        Ok(())
    }

    fn resume(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.resume(job_id)?;
        if let Err(e) = self.ledger.resume(job_id) {
            tracing::warn!(job_id, error = %e, "Resumed job has no ledger allocation");
        }
        Ok(())
    }

    fn requeue(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.requeue(job_id)?;
        self.release(job_id);
        Ok(())
    }

    fn checkpoint(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.checkpoint(job_id)?;
        self.release(job_id);
        Ok(())
    }

    fn cancel(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.cancel(job_id)?;
        self.release(job_id);
        Ok(())
    }

    fn kill(&self, job_id: JobId) -> SchedResult<()> {
        self.inner.kill(job_id)?;
        self.release(job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Fails every op in `failing`, records every call.
    #[derive(Default)]
    struct ScriptedControl {
        failing: HashSet<SignalOp>,
        calls: Mutex<Vec<(SignalOp, JobId)>>,
    }

    impl ScriptedControl {
        fn failing(ops: &[SignalOp]) -> Self {
            Self {
                failing: ops.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, op: SignalOp, job_id: JobId) -> SchedResult<()> {
            self.calls.lock().push((op, job_id));
            if self.failing.contains(&op) {
                Err(SchedError::signal_failure(format!("{op} refused")))
            } else {
                Ok(())
            }
        }

        fn ops(&self) -> Vec<SignalOp> {
            self.calls.lock().iter().map(|(op, _)| *op).collect()
        }
    }

    impl JobControl for ScriptedControl {
        fn suspend(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Suspend, job_id)
        }
        fn resume(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Resume, job_id)
        }
        fn requeue(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Requeue, job_id)
        }
        fn checkpoint(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Checkpoint, job_id)
        }
        fn cancel(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Cancel, job_id)
        }
        fn kill(&self, job_id: JobId) -> SchedResult<()> {
            self.record(SignalOp::Kill, job_id)
        }
    }

    #[test]
    fn test_chain_per_mode() {
        assert!(escalation_chain(PreemptMode::Off).is_empty());
        assert_eq!(escalation_chain(PreemptMode::Suspend).len(), 5);
        assert_eq!(
            escalation_chain(PreemptMode::Checkpoint),
            &[SignalOp::Checkpoint, SignalOp::Cancel, SignalOp::Kill]
        );
    }

    #[test]
    fn test_suspend_success() {
        let control = Arc::new(ScriptedControl::default());
        let esc = Escalator::new(control.clone(), 2);
        let outcome = esc.preempt(4, PreemptMode::Suspend);
        assert_eq!(outcome.applied, Some(SignalOp::Suspend));
        assert!(!outcome.job_left());
        assert_eq!(control.ops(), vec![SignalOp::Suspend]);
    }

    #[test]
    fn test_suspend_retried_then_requeued() {
        let control = Arc::new(ScriptedControl::failing(&[SignalOp::Suspend]));
        let esc = Escalator::new(control.clone(), 2);
        let outcome = esc.preempt(4, PreemptMode::Suspend);
        assert_eq!(outcome.applied, Some(SignalOp::Requeue));
        assert!(outcome.job_left());
        assert_eq!(
            control.ops(),
            vec![SignalOp::Suspend, SignalOp::Suspend, SignalOp::Suspend, SignalOp::Requeue]
        );
        assert!(esc.forced_removals().is_empty());
    }

    #[test]
    fn test_escalates_to_kill() {
        let control = Arc::new(ScriptedControl::failing(&[
            SignalOp::Requeue,
            SignalOp::Checkpoint,
            SignalOp::Cancel,
        ]));
        let esc = Escalator::new(control.clone(), 0);
        let outcome = esc.preempt(8, PreemptMode::Requeue);
        assert_eq!(outcome.applied, Some(SignalOp::Kill));
        let removed = esc.forced_removals();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].killed);
        assert!(removed[0].last_error.message.contains("Cancel"));
    }

    #[test]
    fn test_everything_fails() {
        let control = Arc::new(ScriptedControl::failing(&[SignalOp::Cancel, SignalOp::Kill]));
        let esc = Escalator::new(control, 0);
        let outcome = esc.preempt(9, PreemptMode::Cancel);
        assert_eq!(outcome.applied, None);
        assert!(outcome.job_left());
        let removed = esc.forced_removals();
        assert!(!removed[0].killed);
        assert!(removed[0].last_error.is_signal_failure());
    }

    #[test]
    fn test_resume_failure_not_escalated() {
        let control = Arc::new(ScriptedControl::failing(&[SignalOp::Resume]));
        let esc = Escalator::new(control.clone(), 3);
        assert!(!esc.resume(1));
        assert_eq!(control.ops(), vec![SignalOp::Resume]);
    }

    #[test]
    fn test_ledger_job_control_tracks_ledger() {
        use crate::job_allocation::JobAllocation;
        use crate::node_table::NodeRecord;
        use hpc_common::config::ConsumableResource;
        use hpc_common::NodeSet;

        let ledger = Arc::new(
            ResourceLedger::new(vec![NodeRecord::new("n0", 4)], ConsumableResource::Cpu, false).unwrap(),
        );
        let share = ledger.with_state(|s| s.build_share(0, 4, 0));
        ledger.commit(JobAllocation {
            job_id: 1,
            node_set: NodeSet::full(1),
            node_names: vec!["n0".to_string()],
            shares: vec![share],
            suspended: false,
            start_time: 0,
            end_time: 10,
        });

        let control = LedgerJobControl::new(Arc::new(ScriptedControl::default()), ledger.clone());
        control.suspend(1).unwrap();
        assert_eq!(ledger.available_cpus(0), 4);
        control.resume(1).unwrap();
        assert_eq!(ledger.available_cpus(0), 0);
        control.cancel(1).unwrap();
        assert!(ledger.allocation(1).is_none());

        // Failed signals leave the ledger alone.
        let failing = LedgerJobControl::new(
            Arc::new(ScriptedControl::failing(&[SignalOp::Suspend])),
            ledger.clone(),
        );
        assert!(failing.suspend(1).is_err());
    }
}
