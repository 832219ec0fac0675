// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job-control doubles that record the signals they receive.

use std::collections::HashSet;
use std::sync::Arc;

use hpc_common::{JobId, SchedError, SchedResult};
use hpc_sched::{JobControl, SignalOp};
use parking_lot::Mutex;

/// Accepts every signal and records it.
#[derive(Clone, Default)]
pub struct RecordingJobControl {
    calls: Arc<Mutex<Vec<(SignalOp, JobId)>>>,
}

impl RecordingJobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<(SignalOp, JobId)> {
        self.calls.lock().clone()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<(SignalOp, JobId)> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Calls made for one job.
    pub fn calls_for(&self, job_id: JobId) -> Vec<SignalOp> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, id)| *id == job_id)
            .map(|(op, _)| *op)
            .collect()
    }

    fn record(&self, op: SignalOp, job_id: JobId) {
        self.calls.lock().push((op, job_id));
    }
}

impl JobControl for RecordingJobControl {
    fn suspend(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Suspend, job_id);
        Ok(())
    }
    fn resume(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Resume, job_id);
        Ok(())
    }
    fn requeue(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Requeue, job_id);
        Ok(())
    }
    fn checkpoint(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Checkpoint, job_id);
        Ok(())
    }
    fn cancel(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Cancel, job_id);
        Ok(())
    }
    fn kill(&self, job_id: JobId) -> SchedResult<()> {
        self.record(SignalOp::Kill, job_id);
        Ok(())
    }
}

/// Refuses the listed signals, accepts the rest; records everything.
#[derive(Clone)]
pub struct FailingJobControl {
    failing: Arc<HashSet<SignalOp>>,
    recorder: RecordingJobControl,
}

impl FailingJobControl {
    pub fn new(failing: &[SignalOp]) -> Self {
        Self {
            failing: Arc::new(failing.iter().copied().collect()),
            recorder: RecordingJobControl::new(),
        }
    }

    pub fn calls(&self) -> Vec<(SignalOp, JobId)> {
        self.recorder.calls()
    }

    fn handle(&self, op: SignalOp, job_id: JobId) -> SchedResult<()> {
        self.recorder.record(op, job_id);
        if self.failing.contains(&op) {
            Err(SchedError::signal_failure(format!("{op} refused for job {job_id}")))
        } else {
            Ok(())
        }
    }
}

impl JobControl for FailingJobControl {
    fn suspend(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Suspend, job_id)
    }
    fn resume(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Resume, job_id)
    }
    fn requeue(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Requeue, job_id)
    }
    fn checkpoint(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Checkpoint, job_id)
    }
    fn cancel(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Cancel, job_id)
    }
    fn kill(&self, job_id: JobId) -> SchedResult<()> {
        self.handle(SignalOp::Kill, job_id)
    }
}
