//! Segment planner for parallel scans
//!
//! Splits a full-table scan into independent segments. The table store does
//! the actual keyspace partitioning; each scan call only carries the segment
//! index and the total segment count, so planning is pure bookkeeping and no
//! coordination is needed between workers afterwards.

use crate::models::Segment;

/// Plans segments and assigns them to workers
pub struct SegmentPlanner {
    total_segments: u32,
}

impl SegmentPlanner {
    /// Create a planner for the given segment count
    pub fn new(total_segments: u32) -> Self {
        assert!(total_segments > 0, "total_segments must be > 0");
        Self { total_segments }
    }

    /// Every segment of the scan, in index order
    pub fn plan(&self) -> Vec<Segment> {
        (0..self.total_segments)
            .map(|index| Segment {
                index,
                total: self.total_segments,
            })
            .collect()
    }

    /// Assign segments to workers round-robin
    ///
    /// With as many segments as workers each worker owns exactly one.
    /// With more segments, a worker scans its segments one after another.
    pub fn assign(&self, worker_count: usize) -> Vec<Vec<Segment>> {
        assert!(worker_count > 0, "worker_count must be > 0");
        let mut assignments = vec![Vec::new(); worker_count];
        for segment in self.plan() {
            assignments[segment.index as usize % worker_count].push(segment);
        }
        assignments
    }

    /// Get the segment count
    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }
}
