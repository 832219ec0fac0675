// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Topology block matching for torus/mesh-connected systems.
//!
//! Jobs on such systems are placed on whole blocks: boxes of nodes with
//! a 3-D geometry and a connection type. The matcher looks for a block
//! that is large enough in every dimension (optionally after rotating the
//! requested shape), holds only usable nodes, holds every required node,
//! and is not busy. A block that only fails on being busy reports
//! "runnable later" rather than a failure. When no block fits and a
//! builder is configured, new blocks are carved on demand.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hpc_common::config::SchedConfig;
use hpc_common::{JobId, NodeSet, SchedError, SchedResult};
use parking_lot::Mutex;

use crate::node_table::{JobRequest, NodeRecord};
use crate::selector::{NodeLimits, NodeSelector, Placement, SelectMode};

/// Extents of a box in X, Y, Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry(pub [u16; 3]);

impl Geometry {
    pub fn new(x: u16, y: u16, z: u16) -> Self {
        Self([x, y, z])
    }

    pub fn node_count(&self) -> u32 {
        self.0.iter().map(|&d| u32::from(d)).product()
    }

    /// True when `self` is at least as large as `other` in every dimension.
    pub fn dominates(&self, other: &Geometry) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a >= b)
    }

    /// The six axis permutations, in the order ABC, ACB, CAB, CBA, BCA,
    /// BAC. Produced by alternately swapping (Y,Z) and (X,Y).
    pub fn rotations(&self) -> [Geometry; 6] {
        let mut out = [*self; 6];
        let mut g = self.0;
        for (step, slot) in out.iter_mut().enumerate().skip(1) {
            if step % 2 == 1 {
                g.swap(1, 2);
            } else {
                g.swap(0, 1);
            }
            *slot = Geometry(g);
        }
        out
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Wrap-around links in every dimension.
    Torus,
    Mesh,
    /// No preference.
    Any,
}

impl ConnectionType {
    pub fn accepts(&self, block: ConnectionType) -> bool {
        *self == ConnectionType::Any || *self == block
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "torus" => Ok(Self::Torus),
            "mesh" => Ok(Self::Mesh),
            "any" | "nav" => Ok(Self::Any),
            other => Err(format!("unknown connection type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyBlock {
    pub id: String,
    pub nodes: NodeSet,
    pub geometry: Geometry,
    pub conn_type: ConnectionType,
    pub cpus_per_node: u32,
    pub running_job: Option<JobId>,
    /// Has hosted a job since creation.
    pub booted: bool,
    /// Carved on demand rather than configured.
    pub dynamic: bool,
}

impl TopologyBlock {
    pub fn new(
        id: impl Into<String>,
        nodes: NodeSet,
        geometry: Geometry,
        conn_type: ConnectionType,
        cpus_per_node: u32,
    ) -> Self {
        Self {
            id: id.into(),
            nodes,
            geometry,
            conn_type,
            cpus_per_node,
            running_job: None,
            booted: false,
            dynamic: false,
        }
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.count() as u32
    }

    pub fn overlaps(&self, other: &TopologyBlock) -> bool {
        self.nodes.overlaps(&other.nodes)
    }
}

/// Which existing blocks a dynamic build may carve through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Only nodes in no block.
    FreeSpaceOnly,
    /// Nodes in no booted block.
    UnusedBlocks,
    /// Nodes in no block running a job.
    IdleBlocks,
    /// Any usable node.
    AnyBlocks,
}

impl BuildMode {
    pub const ORDER: [BuildMode; 4] = [
        BuildMode::FreeSpaceOnly,
        BuildMode::UnusedBlocks,
        BuildMode::IdleBlocks,
        BuildMode::AnyBlocks,
    ];
}

/// Carves new blocks when no existing block matches.
pub trait BlockBuilder: Send {
    fn build(
        &mut self,
        request: &JobRequest,
        usable: &NodeSet,
        mode: BuildMode,
        existing: &[TopologyBlock],
    ) -> Option<TopologyBlock>;
}

/// Outcome of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMatch {
    /// The block is free and (when committing) now runs the job.
    RunsNow { block_id: String, nodes: NodeSet },
    /// The block fits but it or an overlapping block is busy.
    RunsLater { block_id: String },
}

/// How far a rejected block got through the checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rejection {
    Capacity,
    ConnectionType,
    Geometry,
}

struct MatcherState {
    blocks: Vec<TopologyBlock>,
    builder: Option<Box<dyn BlockBuilder>>,
}

pub struct BlockMatcher {
    state: Mutex<MatcherState>,
}

impl BlockMatcher {
    pub fn new(blocks: Vec<TopologyBlock>) -> Self {
        Self {
            state: Mutex::new(MatcherState {
                blocks,
                builder: None,
            }),
        }
    }

    /// Matcher over `blocks`, carving new blocks from the node grid when
    /// the configuration enables dynamic blocks.
    pub fn for_cluster(config: &SchedConfig, nodes: &[NodeRecord], blocks: Vec<TopologyBlock>) -> Self {
        let matcher = Self::new(blocks);
        if config.dynamic_blocks {
            matcher.with_builder(Box::new(GridBlockBuilder::new(nodes)))
        } else {
            matcher
        }
    }

    /// Enable dynamic block creation.
    pub fn with_builder(self, builder: Box<dyn BlockBuilder>) -> Self {
        self.state.lock().builder = Some(builder);
        self
    }

    pub fn add_block(&self, block: TopologyBlock) {
        self.state.lock().blocks.push(block);
    }

    pub fn blocks(&self) -> Vec<TopologyBlock> {
        self.state.lock().blocks.clone()
    }

    pub fn block_for_job(&self, job_id: JobId) -> Option<TopologyBlock> {
        self.state
            .lock()
            .blocks
            .iter()
            .find(|b| b.running_job == Some(job_id))
            .cloned()
    }

    /// Clear the running marker of the block hosting `job_id`.
    pub fn release_block(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        match state.blocks.iter_mut().find(|b| b.running_job == Some(job_id)) {
            Some(block) => {
                block.running_job = None;
                tracing::debug!(job_id, block = %block.id, "Released block");
                true
            }
            None => false,
        }
    }

    /// Find a block for `request` among blocks made of `usable` nodes.
    ///
    /// With `commit`, a free match is marked as running the job. A match
    /// that is only blocked by running work yields `RunsLater`; no match
    /// at all is an error naming the furthest check any block reached.
    pub fn find_block(
        &self,
        request: &JobRequest,
        usable: &NodeSet,
        limits: NodeLimits,
        commit: bool,
    ) -> SchedResult<BlockMatch> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        // checked == 0: busy blocks are skipped; checked == 1: tolerated.
        for checked in 0..2 {
            let tolerate_busy = checked == 1;
            if let Ok(i) = find_in(&state.blocks, request, usable, limits, tolerate_busy) {
                return Ok(claim(&mut state.blocks, i, request.job_id, commit, tolerate_busy));
            }
            if checked == 0 {
                if let Some(builder) = state.builder.as_mut() {
                    if let Some(i) = build_and_match(&mut state.blocks, builder.as_mut(), request, usable, limits) {
                        return Ok(claim(&mut state.blocks, i, request.job_id, commit, false));
                    }
                }
            }
        }

        let err = find_in(&state.blocks, request, usable, limits, true)
            .err()
            .unwrap_or(Rejection::Capacity);
        Err(match err {
            Rejection::Geometry => SchedError::geometry_mismatch(format!(
                "no block dominates geometry {}",
                request.geometry.map(|g| g.to_string()).unwrap_or_default()
            )),
            Rejection::ConnectionType => {
                SchedError::connection_type_mismatch(format!("no block with {:?} links", request.conn_type))
            }
            Rejection::Capacity => SchedError::infeasible("no block large enough from usable nodes"),
        })
    }
}

fn claim(blocks: &mut [TopologyBlock], i: usize, job_id: JobId, commit: bool, busy: bool) -> BlockMatch {
    let block = &mut blocks[i];
    if busy {
        return BlockMatch::RunsLater {
            block_id: block.id.clone(),
        };
    }
    if commit {
        block.running_job = Some(job_id);
        block.booted = true;
        tracing::info!(job_id, block = %block.id, geometry = %block.geometry, "Job placed on block");
    }
    BlockMatch::RunsNow {
        block_id: block.id.clone(),
        nodes: block.nodes.clone(),
    }
}

/// Try each build mode in turn; after each new block, retry strict matching.
fn build_and_match(
    blocks: &mut Vec<TopologyBlock>,
    builder: &mut dyn BlockBuilder,
    request: &JobRequest,
    usable: &NodeSet,
    limits: NodeLimits,
) -> Option<usize> {
    for mode in BuildMode::ORDER {
        let Some(block) = builder.build(request, usable, mode, &blocks[..]) else {
            continue;
        };
        // Idle dynamic blocks in the way are torn down.
        blocks.retain(|b| {
            let doomed = b.dynamic && b.running_job.is_none() && b.overlaps(&block);
            if doomed {
                tracing::debug!(block = %b.id, "Destroying overlapped dynamic block");
            }
            !doomed
        });
        tracing::info!(block = %block.id, geometry = %block.geometry, ?mode, "Created dynamic block");
        blocks.push(block);
        if let Ok(i) = find_in(&blocks[..], request, usable, limits, false) {
            return Some(i);
        }
    }
    None
}

fn find_in(
    blocks: &[TopologyBlock],
    request: &JobRequest,
    usable: &NodeSet,
    limits: NodeLimits,
    tolerate_busy: bool,
) -> Result<usize, Rejection> {
    let mut furthest = Rejection::Capacity;
    for (i, block) in blocks.iter().enumerate() {
        match check_block(blocks, block, request, usable, limits, tolerate_busy) {
            Ok(true) => return Ok(i),
            Ok(false) => {}
            Err(r) => furthest = furthest.max(r),
        }
    }
    Err(furthest)
}

/// `Ok(false)` means the block fits but is busy and busy blocks are not
/// tolerated.
fn check_block(
    blocks: &[TopologyBlock],
    block: &TopologyBlock,
    request: &JobRequest,
    usable: &NodeSet,
    limits: NodeLimits,
    tolerate_busy: bool,
) -> Result<bool, Rejection> {
    let node_cnt = block.node_count();
    if node_cnt < limits.min || (limits.max != 0 && node_cnt > limits.max) {
        return Err(Rejection::Capacity);
    }
    if block.cpus_per_node * node_cnt < request.num_procs {
        return Err(Rejection::Capacity);
    }
    if !block.nodes.is_subset_of(usable) {
        return Err(Rejection::Capacity);
    }
    if let Some(required) = &request.required_nodes {
        if !required.is_subset_of(&block.nodes) {
            return Err(Rejection::Capacity);
        }
    }

    let busy = block.running_job.is_some()
        || blocks
            .iter()
            .any(|other| other.id != block.id && other.running_job.is_some() && other.overlaps(block));
    if busy && !tolerate_busy {
        return Ok(false);
    }

    if !request.conn_type.accepts(block.conn_type) {
        return Err(Rejection::ConnectionType);
    }
    if let Some(wanted) = request.geometry {
        let tries = if request.rotate { 6 } else { 1 };
        if !wanted.rotations()[..tries].iter().any(|g| block.geometry.dominates(g)) {
            return Err(Rejection::Geometry);
        }
    }
    Ok(true)
}

/// Carves axis-aligned boxes out of the node coordinate grid.
pub struct GridBlockBuilder {
    dims: [u16; 3],
    /// Node index at each grid position, X-major.
    grid: Vec<Option<usize>>,
    cpus: Vec<u32>,
    universe: usize,
    next_id: u32,
}

impl GridBlockBuilder {
    /// Nodes without coordinates are never used.
    pub fn new(nodes: &[NodeRecord]) -> Self {
        let mut dims = [0u16; 3];
        for coord in nodes.iter().filter_map(|n| n.coord) {
            for d in 0..3 {
                dims[d] = dims[d].max(coord[d] + 1);
            }
        }
        let len = dims.iter().map(|&d| usize::from(d)).product();
        let mut grid = vec![None; len];
        for (i, node) in nodes.iter().enumerate() {
            if let Some(c) = node.coord {
                grid[grid_offset(dims, c)] = Some(i);
            }
        }
        Self {
            dims,
            grid,
            cpus: nodes.iter().map(|n| u32::from(n.cpus)).collect(),
            universe: nodes.len(),
            next_id: 0,
        }
    }

    pub fn dims(&self) -> [u16; 3] {
        self.dims
    }

    fn carve(&self, origin: [u16; 3], geo: Geometry, wrap: bool, allowed: &NodeSet) -> Option<NodeSet> {
        let mut nodes = NodeSet::new(self.universe);
        for dx in 0..geo.0[0] {
            for dy in 0..geo.0[1] {
                for dz in 0..geo.0[2] {
                    let mut pos = [origin[0] + dx, origin[1] + dy, origin[2] + dz];
                    for d in 0..3 {
                        if pos[d] >= self.dims[d] {
                            if !wrap {
                                return None;
                            }
                            pos[d] %= self.dims[d];
                        }
                    }
                    let index = self.grid[grid_offset(self.dims, pos)]?;
                    if !allowed.contains(index) {
                        return None;
                    }
                    nodes.insert(index);
                }
            }
        }
        Some(nodes)
    }
}

fn grid_offset(dims: [u16; 3], pos: [u16; 3]) -> usize {
    let [_, y, z] = dims.map(usize::from);
    (usize::from(pos[0]) * y + usize::from(pos[1])) * z + usize::from(pos[2])
}

impl BlockBuilder for GridBlockBuilder {
    fn build(
        &mut self,
        request: &JobRequest,
        usable: &NodeSet,
        mode: BuildMode,
        existing: &[TopologyBlock],
    ) -> Option<TopologyBlock> {
        let wanted = request.geometry?;
        let mut allowed = usable.clone();
        for block in existing {
            let excluded = match mode {
                BuildMode::FreeSpaceOnly => true,
                BuildMode::UnusedBlocks => block.booted,
                BuildMode::IdleBlocks => block.running_job.is_some(),
                BuildMode::AnyBlocks => false,
            };
            if excluded {
                allowed.subtract(&block.nodes);
            }
        }
        if (allowed.count() as u32) < wanted.node_count() {
            return None;
        }

        let wrap = request.conn_type == ConnectionType::Torus;
        let tries = if request.rotate { 6 } else { 1 };
        for geo in &wanted.rotations()[..tries] {
            if !(0..3).all(|d| geo.0[d] <= self.dims[d]) {
                continue;
            }
            let limit = |d: usize| if wrap { self.dims[d] } else { self.dims[d] - geo.0[d] + 1 };
            for x in 0..limit(0) {
                for y in 0..limit(1) {
                    for z in 0..limit(2) {
                        let Some(nodes) = self.carve([x, y, z], *geo, wrap, &allowed) else {
                            continue;
                        };
                        let cpus_per_node = nodes.iter().map(|i| self.cpus[i]).min().unwrap_or(0);
                        self.next_id += 1;
                        let conn_type = match request.conn_type {
                            ConnectionType::Any => ConnectionType::Mesh,
                            other => other,
                        };
                        let mut block = TopologyBlock::new(
                            format!("dyn{}", self.next_id),
                            nodes,
                            *geo,
                            conn_type,
                            cpus_per_node,
                        );
                        block.dynamic = true;
                        return Some(block);
                    }
                }
            }
        }
        None
    }
}

/// Adapts the block matcher to the node selector interface.
pub struct BlockSelector {
    matcher: Arc<BlockMatcher>,
}

impl BlockSelector {
    pub fn new(matcher: Arc<BlockMatcher>) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &Arc<BlockMatcher> {
        &self.matcher
    }
}

impl NodeSelector for BlockSelector {
    fn select(
        &self,
        request: &JobRequest,
        candidates: &mut NodeSet,
        limits: NodeLimits,
        mode: SelectMode,
        now: u64,
    ) -> SchedResult<Placement> {
        let mut usable = candidates.clone();
        if let Some(excluded) = &request.excluded_nodes {
            usable.subtract(excluded);
        }
        let commit = mode == SelectMode::RunNow;
        match self.matcher.find_block(request, &usable, limits, commit)? {
            BlockMatch::RunsNow { nodes, .. } => {
                *candidates = nodes.clone();
                let alloc_cpus = request.num_procs;
                Ok(Placement::now(nodes, now, alloc_cpus))
            }
            BlockMatch::RunsLater { block_id } => {
                tracing::debug!(job_id = request.job_id, block = %block_id, "Block busy, job runnable later");
                let mut placement = Placement::now(candidates.clone(), now, 0);
                placement.deferred = true;
                Ok(placement)
            }
        }
    }

    fn release(&self, job_id: JobId) -> bool {
        self.matcher.release_block(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(geo: Geometry) -> JobRequest {
        let mut req = JobRequest::new(1, 1, 1);
        req.geometry = Some(geo);
        req
    }

    fn block(id: &str, size: usize, members: impl IntoIterator<Item = usize>, geo: Geometry) -> TopologyBlock {
        TopologyBlock::new(id, NodeSet::from_indices(size, members), geo, ConnectionType::Torus, 1)
    }

    #[test]
    fn test_rotation_order() {
        let rots = Geometry::new(1, 2, 3).rotations();
        let got: Vec<[u16; 3]> = rots.iter().map(|g| g.0).collect();
        assert_eq!(
            got,
            vec![[1, 2, 3], [1, 3, 2], [3, 1, 2], [3, 2, 1], [2, 3, 1], [2, 1, 3]]
        );
    }

    #[test]
    fn test_geometry_dominates() {
        assert!(Geometry::new(2, 2, 4).dominates(&Geometry::new(2, 2, 2)));
        assert!(!Geometry::new(1, 1, 8).dominates(&Geometry::new(2, 2, 2)));
        assert_eq!(Geometry::new(2, 3, 4).node_count(), 24);
    }

    #[test]
    fn test_match_after_rotation() {
        let matcher = BlockMatcher::new(vec![block("b0", 8, 0..8, Geometry::new(4, 2, 1))]);
        let mut req = request(Geometry::new(1, 2, 4));
        let limits = NodeLimits::for_request(&req);
        let result = matcher.find_block(&req, &NodeSet::full(8), limits, false).unwrap();
        assert!(matches!(result, BlockMatch::RunsNow { .. }));

        req.rotate = false;
        let err = matcher.find_block(&req, &NodeSet::full(8), limits, false).unwrap_err();
        assert_eq!(err.code, hpc_common::StatusCode::GeometryMismatch);
    }

    #[test]
    fn test_connection_type_mismatch() {
        let matcher = BlockMatcher::new(vec![block("b0", 4, 0..4, Geometry::new(4, 1, 1))]);
        let mut req = JobRequest::new(1, 1, 1);
        req.conn_type = ConnectionType::Mesh;
        let err = matcher
            .find_block(&req, &NodeSet::full(4), NodeLimits::for_request(&req), false)
            .unwrap_err();
        assert_eq!(err.code, hpc_common::StatusCode::ConnectionTypeMismatch);
    }

    #[test]
    fn test_block_must_be_within_usable_and_hold_required() {
        let matcher = BlockMatcher::new(vec![
            block("b0", 8, 0..4, Geometry::new(4, 1, 1)),
            block("b1", 8, 4..8, Geometry::new(4, 1, 1)),
        ]);
        let mut req = JobRequest::new(1, 1, 1);
        let usable = NodeSet::from_indices(8, 1..8);
        match matcher.find_block(&req, &usable, NodeLimits::for_request(&req), false).unwrap() {
            BlockMatch::RunsNow { block_id, .. } => assert_eq!(block_id, "b1"),
            other => panic!("unexpected {other:?}"),
        }

        req.required_nodes = Some(NodeSet::from_indices(8, [2]));
        let err = matcher
            .find_block(&req, &usable, NodeLimits::for_request(&req), false)
            .unwrap_err();
        assert!(err.is_infeasible());
    }

    #[test]
    fn test_busy_overlap_runs_later() {
        let matcher = BlockMatcher::new(vec![
            block("big", 8, 0..8, Geometry::new(8, 1, 1)),
            block("small", 8, 0..4, Geometry::new(4, 1, 1)),
        ]);
        let mut first = JobRequest::new(1, 4, 4);
        first.max_nodes = 4;
        let placed = matcher
            .find_block(&first, &NodeSet::full(8), NodeLimits::for_request(&first), true)
            .unwrap();
        assert!(matches!(placed, BlockMatch::RunsNow { ref block_id, .. } if block_id == "small"));

        // "big" overlaps the running "small" block.
        let second = JobRequest::new(2, 8, 8);
        let later = matcher
            .find_block(&second, &NodeSet::full(8), NodeLimits::for_request(&second), true)
            .unwrap();
        assert_eq!(later, BlockMatch::RunsLater { block_id: "big".to_string() });

        assert!(matcher.release_block(1));
        assert!(!matcher.release_block(1));
        let now = matcher
            .find_block(&second, &NodeSet::full(8), NodeLimits::for_request(&second), true)
            .unwrap();
        assert!(matches!(now, BlockMatch::RunsNow { .. }));
        assert_eq!(matcher.block_for_job(2).unwrap().id, "big");
    }

    fn grid_nodes(x: u16, y: u16, z: u16) -> Vec<NodeRecord> {
        let mut nodes = Vec::new();
        for i in 0..x {
            for j in 0..y {
                for k in 0..z {
                    nodes.push(NodeRecord::new(format!("bg{i}{j}{k}"), 2).with_coord([i, j, k]));
                }
            }
        }
        nodes
    }

    #[test]
    fn test_dynamic_block_creation() {
        let nodes = grid_nodes(4, 2, 2);
        let builder = GridBlockBuilder::new(&nodes);
        assert_eq!(builder.dims(), [4, 2, 2]);
        let matcher = BlockMatcher::new(vec![]).with_builder(Box::new(builder));

        let mut req = request(Geometry::new(2, 2, 2));
        req.num_procs = 16;
        let usable = NodeSet::full(nodes.len());
        let first = matcher.find_block(&req, &usable, NodeLimits::for_request(&req), true).unwrap();
        let BlockMatch::RunsNow { nodes: first_nodes, .. } = first else {
            panic!("expected a new block");
        };
        assert_eq!(first_nodes.count(), 8);

        // Second job gets the other half of the grid.
        req.job_id = 2;
        let second = matcher.find_block(&req, &usable, NodeLimits::for_request(&req), true).unwrap();
        let BlockMatch::RunsNow { nodes: second_nodes, .. } = second else {
            panic!("expected a second block");
        };
        assert!(!first_nodes.overlaps(&second_nodes));
        assert_eq!(matcher.blocks().len(), 2);
        assert!(matcher.blocks().iter().all(|b| b.dynamic));
    }

    #[test]
    fn test_dynamic_blocks_follow_config() {
        let nodes = grid_nodes(2, 2, 2);
        let req = request(Geometry::new(2, 2, 1));
        let usable = NodeSet::full(nodes.len());
        let limits = NodeLimits::for_request(&req);

        let fixed = BlockMatcher::for_cluster(&SchedConfig::default(), &nodes, vec![]);
        assert!(fixed.find_block(&req, &usable, limits, false).is_err());

        let config = SchedConfig {
            dynamic_blocks: true,
            ..Default::default()
        };
        let dynamic = BlockMatcher::for_cluster(&config, &nodes, vec![]);
        assert!(matches!(
            dynamic.find_block(&req, &usable, limits, false),
            Ok(BlockMatch::RunsNow { .. })
        ));
    }

    #[test]
    fn test_dynamic_build_respects_mesh_bounds() {
        let nodes = grid_nodes(3, 1, 1);
        let mut builder = GridBlockBuilder::new(&nodes);
        let mut req = request(Geometry::new(4, 1, 1));
        req.conn_type = ConnectionType::Mesh;
        assert!(builder
            .build(&req, &NodeSet::full(3), BuildMode::AnyBlocks, &[])
            .is_none());

        req.geometry = Some(Geometry::new(2, 1, 1));
        let block = builder
            .build(&req, &NodeSet::full(3), BuildMode::AnyBlocks, &[])
            .unwrap();
        assert_eq!(block.nodes, NodeSet::from_indices(3, [0, 1]));
        assert_eq!(block.conn_type, ConnectionType::Mesh);
    }

    #[test]
    fn test_block_selector_defers_busy_block() {
        let matcher = Arc::new(BlockMatcher::new(vec![block("b0", 4, 0..4, Geometry::new(4, 1, 1))]));
        let selector = BlockSelector::new(matcher.clone());
        let req = JobRequest::new(1, 4, 4);
        let mut candidates = NodeSet::full(4);
        let placement = selector
            .select(&req, &mut candidates, NodeLimits::for_request(&req), SelectMode::RunNow, 10)
            .unwrap();
        assert!(!placement.deferred);

        let other = JobRequest::new(2, 4, 4);
        let mut candidates = NodeSet::full(4);
        let placement = selector
            .select(&other, &mut candidates, NodeLimits::for_request(&other), SelectMode::RunNow, 10)
            .unwrap();
        assert!(placement.deferred);

        assert!(selector.release(1));
    }
}
