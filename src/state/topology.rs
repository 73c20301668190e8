//! Cache Topology
//!
//! Segment ownership as seen by one node. Which node owns which segment is
//! decided elsewhere; `round_robin` exists so a standalone node has a
//! deterministic placement.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Maps keys to segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPartitioner {
    num_segments: usize,
}

impl KeyPartitioner {
    pub fn new(num_segments: usize) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Segment a key belongs to
    pub fn segment_of(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.num_segments
    }
}

/// A set of segments plus the partitioner needed to test keys against it
#[derive(Debug, Clone)]
pub struct SegmentFilter {
    partitioner: KeyPartitioner,
    segments: BTreeSet<usize>,
}

impl SegmentFilter {
    pub fn new(partitioner: KeyPartitioner, segments: BTreeSet<usize>) -> Self {
        Self {
            partitioner,
            segments,
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.segments.contains(&self.partitioner.segment_of(key))
    }

    pub fn segments(&self) -> &BTreeSet<usize> {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// An installed cache topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Monotonically increasing topology id
    pub topology_id: u64,
    /// Cluster members in view order; the first one coordinates
    pub members: Vec<String>,
    /// Primary owner of each segment
    pub segment_owners: Vec<String>,
    /// Whether data is currently being moved between local nodes
    pub rebalance_in_progress: bool,
}

impl CacheTopology {
    /// Assign segment `i` to `members[i % members.len()]`
    pub fn round_robin(
        topology_id: u64,
        members: Vec<String>,
        num_segments: usize,
        rebalance_in_progress: bool,
    ) -> Self {
        let segment_owners = if members.is_empty() {
            Vec::new()
        } else {
            (0..num_segments.max(1))
                .map(|s| members[s % members.len()].clone())
                .collect()
        };
        Self {
            topology_id,
            members,
            segment_owners,
            rebalance_in_progress,
        }
    }

    /// Key partitioner for this topology
    pub fn partitioner(&self) -> KeyPartitioner {
        KeyPartitioner::new(self.segment_owners.len())
    }

    /// Segments whose primary owner is `node`
    pub fn primary_segments(&self, node: &str) -> SegmentFilter {
        let segments = self
            .segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_str() == node)
            .map(|(segment, _)| segment)
            .collect();
        SegmentFilter::new(self.partitioner(), segments)
    }

    /// The coordinator (first member), if any
    pub fn coordinator(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.members.iter().any(|m| m == node)
    }
}
