// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ledger save and restore.
//!
//! The saved form is a JSON-lines record stream: one header line carrying
//! the plugin tag and format version, one line per allocation, then one
//! line per node with its allocated counters. A stream that does not match
//! this build (tag, version, or node table) is not an error: restore
//! reports a clean slate and the ledger starts empty.

use std::io::ErrorKind;
use std::path::Path;

use hpc_common::constants::{STATE_PLUGIN_TAG, STATE_VERSION};
use hpc_common::{JobId, NodeSet, SchedError, SchedResult};
use serde::{Deserialize, Serialize};

use crate::job_allocation::{JobAllocation, NodeShare};
use crate::resource_ledger::{LedgerState, NodeUsage, ResourceLedger};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateHeader {
    plugin: String,
    version: u16,
    node_count: usize,
}

/// Per-node arrays follow `node_set` member order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllocationRecord {
    job_id: JobId,
    suspended: bool,
    start_time: u64,
    end_time: u64,
    node_set: NodeSet,
    node_names: Vec<String>,
    cpus: Vec<u16>,
    sockets: Vec<u16>,
    cores: Vec<Vec<u16>>,
    memory_mb: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeCounters {
    name: String,
    alloc_cpus: u16,
    alloc_sockets: u16,
    alloc_cores: Vec<u16>,
    alloc_memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StateRecord {
    Allocation(AllocationRecord),
    Node(NodeCounters),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { jobs: usize },
    /// The saved state was unusable; the ledger was left empty.
    CleanSlate(String),
}

impl AllocationRecord {
    fn from_allocation(alloc: &JobAllocation) -> Self {
        // Column order follows the node set; a member without a share leaves
        // the columns short and the record is rejected on restore.
        let shares: Vec<&NodeShare> = alloc
            .node_set
            .iter()
            .filter_map(|i| alloc.share_for(i))
            .collect();
        Self {
            job_id: alloc.job_id,
            suspended: alloc.suspended,
            start_time: alloc.start_time,
            end_time: alloc.end_time,
            node_set: alloc.node_set.clone(),
            node_names: alloc.node_names.clone(),
            cpus: shares.iter().map(|s| s.cpus).collect(),
            sockets: shares.iter().map(|s| s.sockets()).collect(),
            cores: shares.iter().map(|s| s.cores.clone()).collect(),
            memory_mb: shares.iter().map(|s| s.memory_mb).collect(),
        }
    }

    fn into_allocation(self) -> Result<JobAllocation, String> {
        let members: Vec<usize> = self.node_set.iter().collect();
        let n = members.len();
        if self.cpus.len() != n || self.cores.len() != n || self.memory_mb.len() != n {
            return Err(format!(
                "job {} has {} nodes but {} cpu / {} core / {} memory entries",
                self.job_id,
                n,
                self.cpus.len(),
                self.cores.len(),
                self.memory_mb.len()
            ));
        }
        let shares = members
            .iter()
            .enumerate()
            .map(|(k, &node_index)| NodeShare {
                node_index,
                cpus: self.cpus[k],
                cores: self.cores[k].clone(),
                memory_mb: self.memory_mb[k],
            })
            .collect();
        Ok(JobAllocation {
            job_id: self.job_id,
            node_set: self.node_set,
            node_names: self.node_names,
            shares,
            suspended: self.suspended,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

impl NodeCounters {
    fn matches(&self, usage: &NodeUsage) -> bool {
        self.alloc_cpus == usage.alloc_cpus
            && self.alloc_sockets == usage.alloc_sockets
            && self.alloc_cores == usage.alloc_cores
            && self.alloc_memory_mb == usage.alloc_memory_mb
    }
}

/// Serialize the ledger to the record stream.
pub fn encode_state(ledger: &ResourceLedger) -> SchedResult<String> {
    ledger.with_state(|state| {
        let mut out = String::new();
        let header = StateHeader {
            plugin: STATE_PLUGIN_TAG.to_string(),
            version: STATE_VERSION,
            node_count: state.node_count(),
        };
        push_line(&mut out, &header)?;

        let mut allocs: Vec<&JobAllocation> = state.allocations().collect();
        allocs.sort_by_key(|a| a.job_id);
        for alloc in allocs {
            push_line(&mut out, &StateRecord::Allocation(AllocationRecord::from_allocation(alloc)))?;
        }
        for index in 0..state.node_count() {
            let (Some(node), Some(usage)) = (state.node(index), state.usage(index)) else {
                continue;
            };
            push_line(
                &mut out,
                &StateRecord::Node(NodeCounters {
                    name: node.name.clone(),
                    alloc_cpus: usage.alloc_cpus,
                    alloc_sockets: usage.alloc_sockets,
                    alloc_cores: usage.alloc_cores.clone(),
                    alloc_memory_mb: usage.alloc_memory_mb,
                }),
            )?;
        }
        Ok(out)
    })
}

fn push_line<T: Serialize>(out: &mut String, value: &T) -> SchedResult<()> {
    out.push_str(&serde_json::to_string(value)?);
    out.push('\n');
    Ok(())
}

/// Replace the ledger contents with a decoded record stream.
pub fn decode_state(ledger: &ResourceLedger, text: &str) -> RestoreOutcome {
    let (allocs, counters) = match parse_records(ledger, text) {
        Ok(parsed) => parsed,
        Err(reason) => {
            tracing::warn!(%reason, "Saved scheduler state unusable, starting clean");
            ledger.with_state(LedgerState::clear);
            return RestoreOutcome::CleanSlate(reason);
        }
    };

    let jobs = allocs.len();
    ledger.with_state(|state| {
        state.clear();
        for alloc in allocs {
            state.commit(alloc);
        }
        for (index, saved) in counters.iter().enumerate() {
            let Some(usage) = state.usage(index) else {
                continue;
            };
            if !saved.matches(usage) {
                let err = SchedError::consistency(format!(
                    "saved counters for {} disagree with its allocations",
                    saved.name
                ));
                tracing::error!(
                    node = %saved.name,
                    saved_cpus = saved.alloc_cpus,
                    recomputed_cpus = usage.alloc_cpus,
                    error = %err,
                    "Using recomputed node counters"
                );
            }
        }
    });
    tracing::info!(jobs, "Restored scheduler state");
    RestoreOutcome::Restored { jobs }
}

fn parse_records(
    ledger: &ResourceLedger,
    text: &str,
) -> Result<(Vec<JobAllocation>, Vec<NodeCounters>), String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: StateHeader = match lines.next() {
        Some(line) => serde_json::from_str(line).map_err(|e| format!("bad header: {e}"))?,
        None => return Err("empty state".to_string()),
    };
    if header.plugin != STATE_PLUGIN_TAG {
        return Err(format!("plugin tag {:?}, expected {STATE_PLUGIN_TAG:?}", header.plugin));
    }
    if header.version != STATE_VERSION {
        return Err(format!("format version {}, expected {STATE_VERSION}", header.version));
    }
    let node_names = ledger.node_names();
    if header.node_count != node_names.len() {
        return Err(format!(
            "saved for {} nodes, cluster has {}",
            header.node_count,
            node_names.len()
        ));
    }

    let mut allocs = Vec::new();
    let mut counters = Vec::new();
    for (lineno, line) in lines.enumerate() {
        let record: StateRecord =
            serde_json::from_str(line).map_err(|e| format!("bad record {}: {e}", lineno + 2))?;
        match record {
            StateRecord::Allocation(record) => {
                if record.node_set.size() != node_names.len() {
                    return Err(format!(
                        "job {} node set covers {} nodes",
                        record.job_id,
                        record.node_set.size()
                    ));
                }
                allocs.push(record.into_allocation()?);
            }
            StateRecord::Node(record) => {
                let index = counters.len();
                if node_names.get(index) != Some(&record.name) {
                    return Err(format!("node {} saved as {:?}", index, record.name));
                }
                counters.push(record);
            }
        }
    }
    Ok((allocs, counters))
}

/// Write the ledger to `path` via a temporary file and rename.
pub fn save_state(ledger: &ResourceLedger, path: &Path) -> SchedResult<()> {
    let content = encode_state(ledger)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    tracing::debug!(path = %path.display(), "Saved scheduler state");
    Ok(())
}

/// Load `path` into the ledger. A missing file is a clean slate.
pub fn restore_state(ledger: &ResourceLedger, path: &Path) -> SchedResult<RestoreOutcome> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(decode_state(ledger, &text)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No saved scheduler state");
            Ok(RestoreOutcome::CleanSlate("no saved state".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
