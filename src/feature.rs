/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::io::{Cursor, Write};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{BinT, NumT};
use crate::binner::BinMapper;

/// Fraction of rows that must sit at the default bin before a feature is
/// stored sparsely.
const SPARSE_THRESHOLD: f64 = 0.8;

const STORAGE_DENSE: u8 = 0;
const STORAGE_SPARSE: u8 = 1;

#[derive(Debug)]
enum BinStorage {
    /// Still accepting pushes into the per-thread shards.
    Building,
    /// One bin per row.
    Dense(Vec<BinT>),
    /// `(row, bin)` for the rows off the default bin, sorted by row.
    Sparse(Vec<(u32, BinT)>),
}

/// One discretized feature column: a bin mapper plus the per-row bin ids.
/// While loading, rows are pushed concurrently through per-thread shards and
/// merged once at `finish_load`.
#[derive(Debug)]
pub struct Feature {
    bin_mapper: BinMapper,
    default_bin: BinT,
    num_data: usize,
    shards: Vec<Mutex<Vec<(u32, BinT)>>>,
    storage: BinStorage,
}

impl Feature {
    /// A feature ready for pushing, taking ownership of its bin mapper.
    /// `num_threads` bounds the `tid` values that will be pushed with.
    pub fn new(bin_mapper: BinMapper, num_threads: usize) -> Feature {
        let default_bin = bin_mapper.default_bin();
        Feature {
            bin_mapper,
            default_bin,
            num_data: 0,
            shards: (0..usize::max(num_threads, 1)).map(|_| Mutex::new(Vec::new())).collect(),
            storage: BinStorage::Building,
        }
    }

    pub fn bin_mapper(&self) -> &BinMapper {
        &self.bin_mapper
    }

    pub fn num_bins(&self) -> usize {
        self.bin_mapper.num_bins()
    }

    pub fn num_data(&self) -> usize {
        self.num_data
    }

    /// Discretize `value` and record it for `row`. Safe to call concurrently
    /// as long as each thread uses its own `tid` and rows are disjoint.
    pub fn push(&self, tid: usize, row: usize, value: NumT) {
        safety_check!(matches!(self.storage, BinStorage::Building));
        let bin = self.bin_mapper.value_to_bin(value);
        if bin == self.default_bin { return; }
        let mut shard = self.shards[tid].lock().unwrap_or_else(|e| e.into_inner());
        shard.push((row as u32, bin));
    }

    /// Merge the per-thread shards into the final representation: sparse when
    /// enabled and the default bin dominates, dense otherwise.
    pub fn finish_load(&mut self, num_data: usize, is_enable_sparse: bool) {
        let mut pushed: Vec<(u32, BinT)> = Vec::new();
        for shard in &mut self.shards {
            pushed.append(shard.get_mut().unwrap_or_else(|e| e.into_inner()));
        }
        pushed.sort_unstable_by_key(|&(row, _)| row);
        self.shards.clear();
        self.num_data = num_data;

        let default_fraction = 1.0 - pushed.len() as f64 / usize::max(num_data, 1) as f64;
        if is_enable_sparse && default_fraction >= SPARSE_THRESHOLD {
            self.storage = BinStorage::Sparse(pushed);
        } else {
            let mut bins = vec![self.default_bin; num_data];
            for &(row, bin) in &pushed {
                safety_check!((row as usize) < num_data);
                bins[row as usize] = bin;
            }
            self.storage = BinStorage::Dense(bins);
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, BinStorage::Sparse(_))
    }

    /// The bin id of a row; only valid after `finish_load`.
    pub fn bin(&self, row: usize) -> BinT {
        match &self.storage {
            BinStorage::Building => {
                safety_check!(false);
                0
            },
            BinStorage::Dense(bins) => bins[row],
            BinStorage::Sparse(pairs) => {
                match pairs.binary_search_by_key(&(row as u32), |&(r, _)| r) {
                    Ok(i) => pairs[i].1,
                    Err(_) => self.default_bin,
                }
            },
        }
    }

    // - Binary blob codec -------------------------------------------------------------------------

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.bin_mapper.write_to(writer)?;
        match &self.storage {
            BinStorage::Building => {
                safety_check!(false);
                Ok(())
            },
            BinStorage::Dense(bins) => {
                writer.write_u8(STORAGE_DENSE)?;
                writer.write_u32::<LittleEndian>(bins.len() as u32)?;
                for &bin in bins {
                    writer.write_u32::<LittleEndian>(bin)?;
                }
                Ok(())
            },
            BinStorage::Sparse(pairs) => {
                writer.write_u8(STORAGE_SPARSE)?;
                writer.write_u32::<LittleEndian>(pairs.len() as u32)?;
                for &(row, bin) in pairs {
                    writer.write_u32::<LittleEndian>(row)?;
                    writer.write_u32::<LittleEndian>(bin)?;
                }
                Ok(())
            },
        }
    }

    /// Restore a feature from one size-prefixed blob of the dataset binary.
    /// When `used_indices` is non-empty only those rows are materialized,
    /// renumbered to `0..used_indices.len()`.
    pub fn read_from(buffer: &[u8], num_global_data: usize, used_indices: &[usize])
        -> Result<Feature, String>
    {
        let mut cursor = Cursor::new(buffer);
        let err = |e: std::io::Error| format!("truncated feature blob: {}", e);

        let bin_mapper = BinMapper::read_from(&mut cursor).map_err(err)?;
        let default_bin = bin_mapper.default_bin();
        let tag = cursor.read_u8().map_err(err)?;
        let len = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;

        let storage = match tag {
            STORAGE_DENSE => {
                if len != num_global_data {
                    return Err(format!("feature blob holds {} rows, expected {}",
                               len, num_global_data));
                }
                let mut bins = Vec::with_capacity(len);
                for _ in 0..len {
                    bins.push(cursor.read_u32::<LittleEndian>().map_err(err)?);
                }
                if used_indices.is_empty() {
                    BinStorage::Dense(bins)
                } else {
                    BinStorage::Dense(used_indices.iter().map(|&i| bins[i]).collect())
                }
            },
            STORAGE_SPARSE => {
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let row = cursor.read_u32::<LittleEndian>().map_err(err)?;
                    let bin = cursor.read_u32::<LittleEndian>().map_err(err)?;
                    pairs.push((row, bin));
                }
                if used_indices.is_empty() {
                    BinStorage::Sparse(pairs)
                } else {
                    // both sides sorted by row: renumber with a merge scan
                    let mut subset = Vec::new();
                    let mut pi = 0;
                    for (local, &global) in used_indices.iter().enumerate() {
                        while pi < pairs.len() && (pairs[pi].0 as usize) < global { pi += 1; }
                        if pi < pairs.len() && pairs[pi].0 as usize == global {
                            subset.push((local as u32, pairs[pi].1));
                        }
                    }
                    BinStorage::Sparse(subset)
                }
            },
            _ => return Err(format!("unknown feature storage tag {}", tag)),
        };

        let num_data = if used_indices.is_empty() { num_global_data } else { used_indices.len() };
        Ok(Feature {
            bin_mapper,
            default_bin,
            num_data,
            shards: Vec::new(),
            storage,
        })
    }
}




// ------------------------------------------------------------------------------------------------
