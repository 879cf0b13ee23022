/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;

/// Seeded source of the pseudo-random decisions taken while loading: which rows
/// feed bin construction and which rows stay on which machine. Not thread-safe;
/// all draws happen on the orchestrator thread, in row order, so a fixed seed
/// reproduces the exact same decisions.
pub struct Sampler {
    rng: SmallRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Sampler {
        Sampler { rng: SmallRng::seed_from_u64(seed) }
    }

    /// Draw `min(n, k)` distinct indices from `0..n` uniformly without
    /// replacement, ascending.
    pub fn choose_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        let k = usize::min(n, k);
        let mut buffer = vec![0usize; k];
        for i in 0..n {
            if i < k {
                buffer[i] = i;
            } else {
                let r = self.rng.gen_range(0, i + 1);
                if r < k { buffer[r] = i; }
            }
        }
        buffer.sort_unstable();
        buffer
    }

    /// One uniform draw from `0..m`.
    pub fn next_in(&mut self, m: usize) -> usize {
        self.rng.gen_range(0, m)
    }
}

/// Decides, row by row, whether a line of the input belongs to this machine.
/// Implementations carry their own mutable state and must be fed line indices
/// of a single linear pass, in order.
pub trait PartitionFilter {
    fn should_keep(&mut self, line_idx: usize) -> Result<bool, String>;
}

/// Row-granularity partitioning: one draw per row, keep iff it hits our rank.
pub struct RowPartitionFilter {
    sampler: Sampler,
    rank: usize,
    num_machines: usize,
}

impl RowPartitionFilter {
    pub fn new(seed: u64, rank: usize, num_machines: usize) -> RowPartitionFilter {
        safety_check!(rank < num_machines);
        RowPartitionFilter { sampler: Sampler::new(seed), rank, num_machines }
    }
}

impl PartitionFilter for RowPartitionFilter {
    fn should_keep(&mut self, _line_idx: usize) -> Result<bool, String> {
        Ok(self.sampler.next_in(self.num_machines) == self.rank)
    }
}

/// Query-group-granularity partitioning: one draw per group, taken at the
/// group's first row; the decision carries across every row of the group so a
/// group is never split across machines.
pub struct GroupPartitionFilter {
    sampler: Sampler,
    rank: usize,
    num_machines: usize,
    query_boundaries: Vec<usize>,
    qid: usize,
    keep_current: bool,
}

impl GroupPartitionFilter {
    pub fn new(seed: u64, rank: usize, num_machines: usize, query_boundaries: Vec<usize>)
        -> GroupPartitionFilter
    {
        safety_check!(rank < num_machines);
        safety_check!(query_boundaries.len() >= 2 && query_boundaries[0] == 0);
        GroupPartitionFilter {
            sampler: Sampler::new(seed),
            rank,
            num_machines,
            query_boundaries,
            qid: 0,
            keep_current: false,
        }
    }
}

impl PartitionFilter for GroupPartitionFilter {
    fn should_keep(&mut self, line_idx: usize) -> Result<bool, String> {
        let num_queries = self.query_boundaries.len() - 1;
        while line_idx >= self.query_boundaries[self.qid + 1] {
            self.qid += 1;
            if self.qid >= num_queries {
                return Err(format!("row {} lies past the last declared query boundary ({})",
                           line_idx, self.query_boundaries[num_queries]));
            }
        }
        if line_idx == self.query_boundaries[self.qid] {
            self.keep_current = self.sampler.next_in(self.num_machines) == self.rank;
        }
        Ok(self.keep_current)
    }
}




// ------------------------------------------------------------------------------------------------
