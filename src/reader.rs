/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::sampler::{PartitionFilter, Sampler};

/// Number of data lines handed to the processing callback per block when
/// streaming a file.
pub(crate) const BLOCK_SIZE: usize = 1 << 14;

/// Line-oriented reader over a text data file. Empty lines are skipped, a
/// trailing carriage return is stripped, and when `has_header` is set the first
/// non-empty line is kept aside and never counted as data.
pub struct TextReader {
    path: PathBuf,
    has_header: bool,
    first_line: String,
}

impl TextReader {
    pub fn new<P: AsRef<Path>>(path: P, has_header: bool) -> Result<TextReader, String> {
        let mut reader = TextReader {
            path: path.as_ref().to_path_buf(),
            has_header,
            first_line: String::new(),
        };
        if has_header {
            let mut header = None;
            reader.for_each_raw_line(|line| {
                if header.is_none() { header = Some(line); }
                Ok(header.is_none())
            })?;
            reader.first_line = header
                .ok_or_else(|| format!("no header line in {}", reader.path.display()))?;
        }
        Ok(reader)
    }

    /// The header line, empty when the reader was created without one.
    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    pub fn count_line(&self) -> Result<usize, String> {
        self.for_each_line(|_, _| Ok(()))
    }

    /// Every data line plus the global line count (equal to the number of
    /// returned lines).
    pub fn read_all_lines(&self) -> Result<(Vec<String>, usize), String> {
        let mut lines = Vec::new();
        let count = self.for_each_line(|_, line| { lines.push(line); Ok(()) })?;
        Ok((lines, count))
    }

    /// Keep only the lines accepted by `filter`, recording their global line
    /// indices in `used_indices`. Returns the kept lines and the global count.
    pub fn read_and_filter_lines(&self, filter: &mut dyn PartitionFilter,
                                 used_indices: &mut Vec<usize>)
        -> Result<(Vec<String>, usize), String>
    {
        let mut lines = Vec::new();
        let count = self.for_each_line(|i, line| {
            if filter.should_keep(i)? {
                used_indices.push(i);
                lines.push(line);
            }
            Ok(())
        })?;
        Ok((lines, count))
    }

    /// Reservoir sample of `k` lines in a single pass. Returns the sample and
    /// the global line count.
    pub fn sample_from_file(&self, sampler: &mut Sampler, k: usize)
        -> Result<(Vec<String>, usize), String>
    {
        let mut sample = Vec::with_capacity(k);
        let count = self.for_each_line(|i, line| {
            if sample.len() < k {
                sample.push(line);
            } else {
                let r = sampler.next_in(i + 1);
                if r < k { sample[r] = line; }
            }
            Ok(())
        })?;
        Ok((sample, count))
    }

    /// Reservoir sample restricted to the lines accepted by `filter`. The
    /// global indices of every accepted line land in `used_indices`.
    pub fn sample_and_filter_from_file(&self, filter: &mut dyn PartitionFilter,
                                       used_indices: &mut Vec<usize>,
                                       sampler: &mut Sampler, k: usize)
        -> Result<(Vec<String>, usize), String>
    {
        let mut sample = Vec::with_capacity(k);
        let mut kept = 0;
        let count = self.for_each_line(|i, line| {
            if filter.should_keep(i)? {
                used_indices.push(i);
                if sample.len() < k {
                    sample.push(line);
                } else {
                    let r = sampler.next_in(kept + 1);
                    if r < k { sample[r] = line; }
                }
                kept += 1;
            }
            Ok(())
        })?;
        Ok((sample, count))
    }

    /// Stream every data line in blocks; `process` receives the global index of
    /// the block's first line and the block's lines. Returns the global count.
    pub fn read_all_and_process_parallel<F>(&self, mut process: F) -> Result<usize, String>
    where F: FnMut(usize, &mut Vec<String>) -> Result<(), String>
    {
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        let mut start_idx = 0;
        let count = self.for_each_line(|_, line| {
            block.push(line);
            if block.len() >= BLOCK_SIZE {
                process(start_idx, &mut block)?;
                start_idx += block.len();
                block.clear();
            }
            Ok(())
        })?;
        if !block.is_empty() {
            process(start_idx, &mut block)?;
        }
        Ok(count)
    }

    /// Stream only the lines whose global index appears in the sorted
    /// `used_indices`; `process` receives the index of the block's first line
    /// within the kept sequence. Returns the global count.
    pub fn read_part_and_process_parallel<F>(&self, used_indices: &[usize], mut process: F)
        -> Result<usize, String>
    where F: FnMut(usize, &mut Vec<String>) -> Result<(), String>
    {
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        let mut start_idx = 0;
        let mut next = 0;
        let count = self.for_each_line(|i, line| {
            if next < used_indices.len() && used_indices[next] == i {
                next += 1;
                block.push(line);
                if block.len() >= BLOCK_SIZE {
                    process(start_idx, &mut block)?;
                    start_idx += block.len();
                    block.clear();
                }
            }
            Ok(())
        })?;
        if !block.is_empty() {
            process(start_idx, &mut block)?;
        }
        Ok(count)
    }

    /// Iterate the data lines (header skipped) with their global index;
    /// returns the number of data lines.
    fn for_each_line<F>(&self, mut f: F) -> Result<usize, String>
    where F: FnMut(usize, String) -> Result<(), String>
    {
        let mut count = 0;
        let mut skip_header = self.has_header;
        self.for_each_raw_line(|line| {
            if skip_header {
                skip_header = false;
            } else {
                f(count, line)?;
                count += 1;
            }
            Ok(true)
        })?;
        Ok(count)
    }

    /// Iterate every non-empty line of the file. The callback returns whether
    /// iteration should continue.
    fn for_each_raw_line<F>(&self, mut f: F) -> Result<(), String>
    where F: FnMut(String) -> Result<bool, String>
    {
        let file = File::open(&self.path)
            .map_err(|err| format!("cannot open data file {}: {}", self.path.display(), err))?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let mut line = line
                .map_err(|err| format!("read error in {}: {}", self.path.display(), err))?;
            while line.ends_with('\r') { line.pop(); }
            if line.trim().is_empty() { continue; }
            if !f(line)? { break; }
        }
        Ok(())
    }
}




// ------------------------------------------------------------------------------------------------
