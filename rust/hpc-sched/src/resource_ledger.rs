// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource ledger: per-node allocated capacity with job-scoped accounting.
//!
//! One entry per node records the CPUs, sockets, cores, and memory
//! currently granted to jobs. All mutation happens under a single lock;
//! selectors that need test-then-commit atomicity run their whole sequence
//! inside [`ResourceLedger::with_state`].
//!
//! Counters never go negative and never exceed physical capacity. A
//! mutation that would break either bound is clamped and logged as a
//! consistency error; scheduling continues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use hpc_common::config::ConsumableResource;
use hpc_common::{JobId, NodeSet, SchedError, SchedResult};
use parking_lot::Mutex;

use crate::job_allocation::{JobAllocation, NodeShare};
use crate::node_table::NodeRecord;

/// Allocated counters for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUsage {
    pub alloc_cpus: u16,
    /// Sockets on which at least one core is allocated.
    pub alloc_sockets: u16,
    /// Allocated cores, one slot per socket.
    pub alloc_cores: Vec<u16>,
    pub alloc_memory_mb: u64,
}

impl NodeUsage {
    fn for_node(node: &NodeRecord) -> Self {
        Self {
            alloc_cores: vec![0; node.sockets as usize],
            ..Default::default()
        }
    }

    fn refresh_sockets(&mut self) {
        self.alloc_sockets = self.alloc_cores.iter().filter(|&&c| c > 0).count() as u16;
    }

    pub fn is_idle(&self) -> bool {
        self.alloc_cpus == 0 && self.alloc_memory_mb == 0 && self.alloc_cores.iter().all(|&c| c == 0)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub node: NodeRecord,
    pub usage: NodeUsage,
}

/// Which dimensions of a share an accounting step touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    All,
    Compute,
    Memory,
}

/// The lock-protected ledger contents.
pub struct LedgerState {
    entries: Vec<LedgerEntry>,
    name_index: Option<HashMap<String, usize>>,
    allocations: HashMap<JobId, JobAllocation>,
    resource: ConsumableResource,
    track_memory: bool,
    mutations: i64,
}

impl LedgerState {
    pub fn node_count(&self) -> usize {
        self.entries.len()
    }

    pub fn node(&self, index: usize) -> Option<&NodeRecord> {
        self.entries.get(index).map(|e| &e.node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> + '_ {
        self.entries.iter().map(|e| &e.node)
    }

    pub fn usage(&self, index: usize) -> Option<&NodeUsage> {
        self.entries.get(index).map(|e| &e.usage)
    }

    pub fn resource(&self) -> ConsumableResource {
        self.resource
    }

    pub fn track_memory(&self) -> bool {
        self.track_memory
    }

    /// Resolve a node name to its index.
    pub fn lookup(&self, name: &str) -> SchedResult<usize> {
        let found = match &self.name_index {
            Some(index) => index.get(name).copied(),
            None => {
                tracing::warn!(node = name, "Node name index missing, falling back to linear scan");
                self.entries.iter().position(|e| e.node.name == name)
            }
        };
        found.ok_or_else(|| SchedError::lookup_failure(format!("node {name} not in ledger")))
    }

    /// Drop the name index. Lookups scan linearly until it is rebuilt.
    pub fn invalidate_index(&mut self) {
        self.name_index = None;
    }

    pub fn rebuild_index(&mut self) {
        let index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.node.name.clone(), i))
            .collect();
        self.name_index = Some(index);
    }

    /// CPUs still grantable on a node under the configured consumable
    /// resource. Whole free cores or sockets are converted to CPUs.
    pub fn available_cpus(&self, index: usize) -> u16 {
        let Some(entry) = self.entries.get(index) else {
            return 0;
        };
        let node = &entry.node;
        let usage = &entry.usage;
        let by_cpu = node.cpus.saturating_sub(usage.alloc_cpus);
        match self.resource {
            ConsumableResource::Cpu => by_cpu,
            ConsumableResource::Core => {
                let used: u16 = usage.alloc_cores.iter().sum();
                let free_cores = node.total_cores().saturating_sub(used);
                (free_cores * node.threads_per_core).min(by_cpu)
            }
            ConsumableResource::Socket => {
                let free_sockets = usage.alloc_cores.iter().filter(|&&c| c == 0).count() as u16;
                (free_sockets * node.cores_per_socket * node.threads_per_core).min(by_cpu)
            }
        }
    }

    pub fn available_memory(&self, index: usize) -> u64 {
        self.entries
            .get(index)
            .map(|e| e.node.real_memory_mb.saturating_sub(e.usage.alloc_memory_mb))
            .unwrap_or(0)
    }

    /// Nodes carrying at least one allocation, suspended ones included.
    pub fn busy_nodes(&self) -> NodeSet {
        let mut busy = NodeSet::new(self.entries.len());
        for alloc in self.allocations.values() {
            busy.union_with(&alloc.node_set);
        }
        busy
    }

    pub fn allocation(&self, job_id: JobId) -> Option<&JobAllocation> {
        self.allocations.get(&job_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &JobAllocation> + '_ {
        self.allocations.values()
    }

    /// Build the share a job would take on a node when granted `cpus`.
    /// Cores are taken from sockets in order, skipping full ones; socket
    /// granularity hands out whole free sockets.
    pub fn build_share(&self, index: usize, cpus: u16, memory_mb: u64) -> NodeShare {
        let mut share = NodeShare {
            node_index: index,
            cpus,
            cores: Vec::new(),
            memory_mb: if self.track_memory { memory_mb } else { 0 },
        };
        let Some(entry) = self.entries.get(index) else {
            return share;
        };
        let node = &entry.node;
        share.cores = vec![0; node.sockets as usize];
        let mut cores_needed = cpus.div_ceil(node.threads_per_core.max(1));

        for (socket, used) in entry.usage.alloc_cores.iter().enumerate() {
            if cores_needed == 0 {
                break;
            }
            let free = node.cores_per_socket.saturating_sub(*used);
            let take = match self.resource {
                ConsumableResource::Socket if *used > 0 => 0,
                ConsumableResource::Socket => node.cores_per_socket,
                _ => free.min(cores_needed),
            };
            share.cores[socket] = take;
            cores_needed = cores_needed.saturating_sub(take);
        }
        share
    }

    /// Record an allocation, replacing (and first releasing) any prior
    /// allocation for the same job.
    pub fn commit(&mut self, alloc: JobAllocation) {
        if self.allocations.contains_key(&alloc.job_id) {
            tracing::debug!(job_id = alloc.job_id, "Replacing existing allocation");
            self.release(alloc.job_id);
        }
        let dim = if alloc.suspended {
            Dimension::Memory
        } else {
            Dimension::All
        };
        for share in &alloc.shares {
            self.add_share(alloc.job_id, share, dim);
        }
        tracing::debug!(
            job_id = alloc.job_id,
            nodes = %alloc.node_set,
            cpus = alloc.total_cpus(),
            "Committed allocation"
        );
        self.allocations.insert(alloc.job_id, alloc);
        self.mutations += 1;
    }

    /// Return a job's resources. Returns false when the job holds nothing,
    /// which makes a second release a no-op.
    pub fn release(&mut self, job_id: JobId) -> bool {
        let Some(alloc) = self.allocations.remove(&job_id) else {
            tracing::debug!(job_id, "Release of unknown job ignored");
            return false;
        };
        let dim = if alloc.suspended {
            Dimension::Memory
        } else {
            Dimension::All
        };
        for share in &alloc.shares {
            self.remove_share(job_id, share, dim);
        }
        tracing::debug!(job_id, nodes = %alloc.node_set, "Released allocation");
        self.mutations += 1;
        true
    }

    /// Hand a job's compute resources back while keeping its record and
    /// memory. Suspending a suspended job is a no-op.
    pub fn suspend(&mut self, job_id: JobId) -> SchedResult<()> {
        let alloc = self
            .allocations
            .get(&job_id)
            .ok_or_else(|| SchedError::lookup_failure(format!("job {job_id} has no allocation")))?;
        if alloc.suspended {
            return Ok(());
        }
        let shares = alloc.shares.clone();
        for share in &shares {
            self.remove_share(job_id, share, Dimension::Compute);
        }
        if let Some(alloc) = self.allocations.get_mut(&job_id) {
            alloc.suspended = true;
        }
        self.mutations += 1;
        Ok(())
    }

    pub fn resume(&mut self, job_id: JobId) -> SchedResult<()> {
        let alloc = self
            .allocations
            .get(&job_id)
            .ok_or_else(|| SchedError::lookup_failure(format!("job {job_id} has no allocation")))?;
        if !alloc.suspended {
            return Ok(());
        }
        let shares = alloc.shares.clone();
        for share in &shares {
            self.add_share(job_id, share, Dimension::Compute);
        }
        if let Some(alloc) = self.allocations.get_mut(&job_id) {
            alloc.suspended = false;
        }
        self.mutations += 1;
        Ok(())
    }

    /// Drop every allocation and zero every counter.
    pub fn clear(&mut self) {
        self.allocations.clear();
        for entry in &mut self.entries {
            entry.usage = NodeUsage::for_node(&entry.node);
        }
        self.mutations += 1;
    }

    fn add_share(&mut self, job_id: JobId, share: &NodeShare, dim: Dimension) {
        let Some(entry) = self.entries.get_mut(share.node_index) else {
            tracing::error!(job_id, node_index = share.node_index, "Share for node outside ledger");
            return;
        };
        let node = &entry.node;
        let usage = &mut entry.usage;

        if dim != Dimension::Memory {
            usage.alloc_cpus = clamped_add(usage.alloc_cpus, share.cpus, node.cpus, job_id, &node.name, "cpus");
            for (socket, cores) in share.cores.iter().enumerate() {
                if let Some(slot) = usage.alloc_cores.get_mut(socket) {
                    *slot = clamped_add(*slot, *cores, node.cores_per_socket, job_id, &node.name, "cores");
                }
            }
            usage.refresh_sockets();
        }
        if dim != Dimension::Compute && share.memory_mb > 0 {
            let total = usage.alloc_memory_mb.saturating_add(share.memory_mb);
            usage.alloc_memory_mb = if total > node.real_memory_mb {
                tracing::error!(
                    job_id,
                    node = %node.name,
                    allocated = total,
                    physical = node.real_memory_mb,
                    "Memory allocation exceeds capacity, clamping"
                );
                node.real_memory_mb
            } else {
                total
            };
        }
    }

    fn remove_share(&mut self, job_id: JobId, share: &NodeShare, dim: Dimension) {
        let Some(entry) = self.entries.get_mut(share.node_index) else {
            tracing::error!(job_id, node_index = share.node_index, "Share for node outside ledger");
            return;
        };
        let name = &entry.node.name;
        let usage = &mut entry.usage;

        if dim != Dimension::Memory {
            usage.alloc_cpus = clamped_sub(usage.alloc_cpus, share.cpus, job_id, name, "cpus");
            for (socket, cores) in share.cores.iter().enumerate() {
                if let Some(slot) = usage.alloc_cores.get_mut(socket) {
                    *slot = clamped_sub(*slot, *cores, job_id, name, "cores");
                }
            }
            usage.refresh_sockets();
        }
        if dim != Dimension::Compute && share.memory_mb > 0 {
            usage.alloc_memory_mb = if usage.alloc_memory_mb < share.memory_mb {
                tracing::error!(
                    job_id,
                    node = %name,
                    allocated = usage.alloc_memory_mb,
                    released = share.memory_mb,
                    "Memory count underflow, clamping to zero"
                );
                0
            } else {
                usage.alloc_memory_mb - share.memory_mb
            };
        }
    }
}

fn clamped_add(current: u16, delta: u16, capacity: u16, job_id: JobId, node: &str, what: &str) -> u16 {
    let total = current.saturating_add(delta);
    if total > capacity {
        tracing::error!(
            job_id,
            node,
            resource = what,
            allocated = total,
            physical = capacity,
            "Allocation exceeds capacity, clamping"
        );
        capacity
    } else {
        total
    }
}

fn clamped_sub(current: u16, delta: u16, job_id: JobId, node: &str, what: &str) -> u16 {
    if current < delta {
        tracing::error!(
            job_id,
            node,
            resource = what,
            allocated = current,
            released = delta,
            "Allocation count underflow, clamping to zero"
        );
        0
    } else {
        current - delta
    }
}

/// The per-node resource ledger shared by selectors and the gang scheduler.
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
    /// Monotonic version counter (incremented on any state change).
    version: AtomicI64,
}

impl ResourceLedger {
    /// Build one entry per node plus the name index. Fails on an empty
    /// node table.
    pub fn new(
        nodes: Vec<NodeRecord>,
        resource: ConsumableResource,
        track_memory: bool,
    ) -> SchedResult<Self> {
        if nodes.is_empty() {
            return Err(SchedError::invalid_argument("ledger needs at least one node"));
        }
        let entries = nodes
            .into_iter()
            .map(|node| LedgerEntry {
                usage: NodeUsage::for_node(&node),
                node,
            })
            .collect();
        let mut state = LedgerState {
            entries,
            name_index: None,
            allocations: HashMap::new(),
            resource,
            track_memory,
            mutations: 0,
        };
        state.rebuild_index();
        tracing::info!(nodes = state.node_count(), %resource, track_memory, "Resource ledger initialized");
        Ok(Self {
            state: Mutex::new(state),
            version: AtomicI64::new(0),
        })
    }

    /// Run `f` with the ledger locked. Everything `f` reads and writes is
    /// atomic with respect to other ledger users.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.version.store(state.mutations, Ordering::Relaxed);
        result
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().node_count()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.state.lock().nodes().map(|n| n.name.clone()).collect()
    }

    pub fn lookup(&self, name: &str) -> SchedResult<usize> {
        self.state.lock().lookup(name)
    }

    pub fn available_cpus(&self, index: usize) -> u16 {
        self.state.lock().available_cpus(index)
    }

    pub fn usage(&self, index: usize) -> Option<NodeUsage> {
        self.state.lock().usage(index).cloned()
    }

    pub fn allocation(&self, job_id: JobId) -> Option<JobAllocation> {
        self.state.lock().allocation(job_id).cloned()
    }

    pub fn commit(&self, alloc: JobAllocation) {
        self.with_state(|s| s.commit(alloc));
    }

    pub fn release(&self, job_id: JobId) -> bool {
        self.with_state(|s| s.release(job_id))
    }

    pub fn suspend(&self, job_id: JobId) -> SchedResult<()> {
        self.with_state(|s| s.suspend(job_id))
    }

    pub fn resume(&self, job_id: JobId) -> SchedResult<()> {
        self.with_state(|s| s.resume(job_id))
    }

    pub fn invalidate_index(&self) {
        self.with_state(|s| s.invalidate_index());
    }

    pub fn rebuild_index(&self) {
        self.with_state(|s| s.rebuild_index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(cpus: &[u16]) -> ResourceLedger {
        let nodes = cpus
            .iter()
            .enumerate()
            .map(|(i, c)| NodeRecord::new(format!("n{i}"), *c).with_memory(1024))
            .collect();
        ResourceLedger::new(nodes, ConsumableResource::Cpu, true).unwrap()
    }

    fn alloc(ledger: &ResourceLedger, job_id: JobId, shares: &[(usize, u16)]) -> JobAllocation {
        ledger.with_state(|s| {
            let node_set = NodeSet::from_indices(s.node_count(), shares.iter().map(|(i, _)| *i));
            JobAllocation {
                job_id,
                node_set,
                node_names: shares.iter().map(|(i, _)| format!("n{i}")).collect(),
                shares: shares.iter().map(|(i, c)| s.build_share(*i, *c, 256)).collect(),
                suspended: false,
                start_time: 0,
                end_time: 100,
            }
        })
    }

    #[test]
    fn test_empty_node_table_rejected() {
        let err = ResourceLedger::new(vec![], ConsumableResource::Cpu, false)
            .err()
            .unwrap();
        assert_eq!(err.code, hpc_common::StatusCode::InvalidArgument);
    }

    #[test]
    fn test_commit_release_round_trip() {
        let ledger = ledger(&[4, 4]);
        let before: Vec<_> = (0..2).map(|i| ledger.usage(i).unwrap()).collect();

        ledger.commit(alloc(&ledger, 1, &[(0, 3), (1, 1)]));
        assert_eq!(ledger.available_cpus(0), 1);
        assert_eq!(ledger.available_cpus(1), 3);
        assert_eq!(ledger.usage(0).unwrap().alloc_memory_mb, 256);

        assert!(ledger.release(1));
        let after: Vec<_> = (0..2).map(|i| ledger.usage(i).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let ledger = ledger(&[2]);
        ledger.commit(alloc(&ledger, 7, &[(0, 2)]));
        assert!(ledger.release(7));
        assert!(!ledger.release(7));
        assert_eq!(ledger.available_cpus(0), 2);
    }

    #[test]
    fn test_recommit_replaces_prior_allocation() {
        let ledger = ledger(&[4, 4]);
        ledger.commit(alloc(&ledger, 1, &[(0, 4)]));
        ledger.commit(alloc(&ledger, 1, &[(1, 2)]));
        assert_eq!(ledger.available_cpus(0), 4);
        assert_eq!(ledger.available_cpus(1), 2);
    }

    #[test]
    fn test_overcommit_clamps_at_capacity() {
        let ledger = ledger(&[2]);
        ledger.commit(alloc(&ledger, 1, &[(0, 2)]));
        let mut extra = alloc(&ledger, 2, &[(0, 2)]);
        extra.shares[0].cpus = 2;
        ledger.commit(extra);
        assert_eq!(ledger.usage(0).unwrap().alloc_cpus, 2);
        assert_eq!(ledger.available_cpus(0), 0);

        // Releasing both never drives the counter negative.
        ledger.release(1);
        ledger.release(2);
        assert_eq!(ledger.usage(0).unwrap().alloc_cpus, 0);
    }

    #[test]
    fn test_suspend_keeps_memory() {
        let ledger = ledger(&[4]);
        ledger.commit(alloc(&ledger, 3, &[(0, 4)]));
        ledger.suspend(3).unwrap();
        assert_eq!(ledger.available_cpus(0), 4);
        assert_eq!(ledger.usage(0).unwrap().alloc_memory_mb, 256);
        assert!(ledger.allocation(3).unwrap().suspended);

        // Idempotent.
        ledger.suspend(3).unwrap();
        assert_eq!(ledger.available_cpus(0), 4);

        ledger.resume(3).unwrap();
        assert_eq!(ledger.available_cpus(0), 0);

        ledger.suspend(3).unwrap();
        ledger.release(3);
        assert!(ledger.usage(0).unwrap().is_idle());
    }

    #[test]
    fn test_suspend_unknown_job() {
        let ledger = ledger(&[1]);
        assert!(ledger.suspend(42).unwrap_err().is_lookup_failure());
    }

    #[test]
    fn test_lookup_with_and_without_index() {
        let ledger = ledger(&[1, 1, 1]);
        assert_eq!(ledger.lookup("n2").unwrap(), 2);
        ledger.invalidate_index();
        assert_eq!(ledger.lookup("n1").unwrap(), 1);
        assert!(ledger.lookup("missing").unwrap_err().is_lookup_failure());
        ledger.rebuild_index();
        assert_eq!(ledger.lookup("n0").unwrap(), 0);
    }

    #[test]
    fn test_core_granularity() {
        let node = NodeRecord::new("n0", 8).with_layout(2, 2, 2);
        let ledger = ResourceLedger::new(vec![node], ConsumableResource::Core, false).unwrap();
        let a = alloc(&ledger, 1, &[(0, 3)]);
        assert_eq!(a.shares[0].cores, vec![2, 0]);
        ledger.commit(a);
        // 3 CPUs round up to 2 whole cores; 2 cores * 2 threads remain.
        assert_eq!(ledger.available_cpus(0), 4);
        assert_eq!(ledger.usage(0).unwrap().alloc_sockets, 1);
    }

    #[test]
    fn test_socket_granularity() {
        let node = NodeRecord::new("n0", 8).with_layout(2, 4, 1);
        let ledger = ResourceLedger::new(vec![node], ConsumableResource::Socket, false).unwrap();
        let a = alloc(&ledger, 1, &[(0, 1)]);
        assert_eq!(a.shares[0].cores, vec![4, 0]);
        ledger.commit(a);
        assert_eq!(ledger.available_cpus(0), 4);
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let ledger = ledger(&[2]);
        let v0 = ledger.version();
        ledger.commit(alloc(&ledger, 1, &[(0, 1)]));
        let v1 = ledger.version();
        assert!(v1 > v0);
        ledger.release(1);
        assert!(ledger.version() > v1);
    }
}
