/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::cmp::Ordering;
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{BinT, NumT};

/// Quantizer from a continuous feature value to a small bin id. Bin `b` holds
/// the values `v <= upper_bounds[b]` not claimed by an earlier bin; the last
/// upper bound is +inf so every value lands somewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct BinMapper {
    upper_bounds: Vec<NumT>,
}

impl BinMapper {
    /// Learn a quantization from a sample of a feature column. `values` holds
    /// the non-zero sampled values only; the remaining
    /// `total_sample_cnt - values.len()` sampled rows count as zeros.
    pub fn find_bin(values: &[NumT], total_sample_cnt: usize, max_bin: usize) -> BinMapper {
        safety_check!(max_bin >= 1);
        safety_check!(values.len() <= total_sample_cnt);

        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        // distinct values with counts, the implicit zeros merged in order
        let zero_cnt = total_sample_cnt - values.len();
        let mut distinct = Vec::new();
        let mut counts: Vec<usize> = Vec::new();
        let mut zero_inserted = zero_cnt == 0;
        for &v in &sorted {
            if !zero_inserted && v > 0.0 {
                distinct.push(0.0);
                counts.push(zero_cnt);
                zero_inserted = true;
            }
            match counts.last_mut() {
                Some(count) if distinct.last() == Some(&v) => *count += 1,
                _ => {
                    distinct.push(v);
                    counts.push(1);
                },
            }
        }
        if !zero_inserted {
            distinct.push(0.0);
            counts.push(zero_cnt);
        }

        let mut upper_bounds = Vec::with_capacity(usize::min(distinct.len(), max_bin));
        if distinct.len() <= max_bin {
            // midpoints between consecutive distinct values
            for w in distinct.windows(2) {
                upper_bounds.push((w[0] + w[1]) / 2.0);
            }
        } else {
            // equal-frequency cuts; a value heavy enough to fill a bin on its
            // own gets cut off from its lighter neighbors
            let mut rest = total_sample_cnt as NumT;
            let mut bins_left = max_bin;
            let mut acc = 0usize;
            for i in 0..distinct.len() - 1 {
                acc += counts[i];
                let target = rest / bins_left as NumT;
                if (acc as NumT) >= target || (counts[i + 1] as NumT) >= target {
                    upper_bounds.push((distinct[i] + distinct[i + 1]) / 2.0);
                    rest -= acc as NumT;
                    acc = 0;
                    bins_left -= 1;
                    if bins_left <= 1 { break; }
                }
            }
        }
        upper_bounds.push(std::f64::INFINITY);
        safety_check!(upper_bounds.len() <= max_bin);

        BinMapper { upper_bounds }
    }

    /// A single-valued feature: one bin, no splitting signal.
    pub fn is_trivial(&self) -> bool {
        self.upper_bounds.len() <= 1
    }

    pub fn num_bins(&self) -> usize {
        self.upper_bounds.len()
    }

    /// The bin of the implicit zero value; rows never pushed sit here.
    pub fn default_bin(&self) -> BinT {
        self.value_to_bin(0.0)
    }

    pub fn value_to_bin(&self, value: NumT) -> BinT {
        let mut lo = 0;
        let mut hi = self.upper_bounds.len() - 1;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if value <= self.upper_bounds[mid] {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as BinT
    }

    pub fn upper_bound(&self, bin: usize) -> NumT {
        self.upper_bounds[bin]
    }

    // - Fixed-size codec for the distributed allgather path ---------------------------------------

    /// Byte size of one fixed serialization slot, a function of `max_bin` only
    /// so every machine can address every shard.
    pub fn size_for_max_bin(max_bin: usize) -> usize {
        4 + 8 * max_bin
    }

    /// Serialize into a fixed slot of `size_for_max_bin(max_bin)` bytes; the
    /// tail beyond `num_bins` bounds is left untouched.
    pub fn copy_to(&self, buffer: &mut [u8]) {
        safety_check!(buffer.len() >= 4 + 8 * self.upper_bounds.len());
        LittleEndian::write_u32(&mut buffer[..4], self.upper_bounds.len() as u32);
        for (i, &bound) in self.upper_bounds.iter().enumerate() {
            LittleEndian::write_f64(&mut buffer[4 + 8 * i..4 + 8 * (i + 1)], bound);
        }
    }

    /// Inverse of `copy_to`.
    pub fn copy_from(buffer: &[u8]) -> BinMapper {
        let num_bins = LittleEndian::read_u32(&buffer[..4]) as usize;
        safety_check!(buffer.len() >= 4 + 8 * num_bins);
        let upper_bounds = (0..num_bins)
            .map(|i| LittleEndian::read_f64(&buffer[4 + 8 * i..4 + 8 * (i + 1)]))
            .collect();
        BinMapper { upper_bounds }
    }

    // - Variable-size codec for the dataset binary ------------------------------------------------

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.upper_bounds.len() as u32)?;
        for &bound in &self.upper_bounds {
            writer.write_f64::<LittleEndian>(bound)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<BinMapper> {
        let num_bins = reader.read_u32::<LittleEndian>()? as usize;
        let mut upper_bounds = Vec::with_capacity(num_bins);
        for _ in 0..num_bins {
            upper_bounds.push(reader.read_f64::<LittleEndian>()?);
        }
        Ok(BinMapper { upper_bounds })
    }
}




// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn few_distinct_values_use_midpoints() {
        // sample: 1, 2, 3 plus one implicit zero
        let mapper = BinMapper::find_bin(&[1.0, 2.0, 3.0], 4, 16);
        assert_eq!(mapper.num_bins(), 4);
        assert!(!mapper.is_trivial());
        assert_eq!(mapper.value_to_bin(0.0), 0);
        assert_eq!(mapper.value_to_bin(1.0), 1);
        assert_eq!(mapper.value_to_bin(1.4), 1);
        assert_eq!(mapper.value_to_bin(1.6), 2);
        assert_eq!(mapper.value_to_bin(3.0), 3);
        assert_eq!(mapper.value_to_bin(1e100), 3);
    }

    #[test]
    fn negative_values_sort_before_zero() {
        let mapper = BinMapper::find_bin(&[-2.0, -1.0, 1.0], 5, 16);
        // distinct: -2, -1, 0, 1
        assert_eq!(mapper.num_bins(), 4);
        assert_eq!(mapper.value_to_bin(-2.0), 0);
        assert_eq!(mapper.value_to_bin(-1.0), 1);
        assert_eq!(mapper.value_to_bin(0.0), 2);
        assert_eq!(mapper.default_bin(), 2);
        assert_eq!(mapper.value_to_bin(1.0), 3);
    }

    #[test]
    fn bin_count_is_bounded_by_max_bin() {
        let values: Vec<NumT> = (1..=1000).map(|i| i as NumT).collect();
        let mapper = BinMapper::find_bin(&values, 1000, 8);
        assert!(mapper.num_bins() <= 8);
        assert!(mapper.num_bins() >= 7); // equal-frequency cuts should use most of the bins
        // bins are ordered
        for b in 0..mapper.num_bins() - 1 {
            assert!(mapper.upper_bound(b) < mapper.upper_bound(b + 1));
        }
    }

    #[test]
    fn repeated_values_are_never_split() {
        // 90% of the mass on 5.0: 5.0 must fall entirely inside one bin
        let mut values = vec![5.0; 90];
        values.extend((1..=10).map(|i| i as NumT * 0.1));
        let mapper = BinMapper::find_bin(&values, 100, 4);
        let bin5 = mapper.value_to_bin(5.0) as usize;
        assert!(mapper.upper_bound(bin5) >= 5.0);
        assert!(bin5 > 0);
        assert!(mapper.upper_bound(bin5 - 1) < 5.0);
    }

    #[test]
    fn single_value_is_trivial() {
        let mapper = BinMapper::find_bin(&[5.0; 20], 20, 16);
        // distinct: 0 is absent (no zeros), only 5.0
        assert!(mapper.is_trivial());
        assert_eq!(mapper.num_bins(), 1);
    }

    #[test]
    fn all_zero_sample_is_trivial() {
        let mapper = BinMapper::find_bin(&[], 50, 16);
        assert!(mapper.is_trivial());
        assert_eq!(mapper.value_to_bin(123.0), 0);
    }

    #[test]
    fn empty_sample_is_trivial() {
        let mapper = BinMapper::find_bin(&[], 0, 16);
        assert!(mapper.is_trivial());
    }

    #[test]
    fn fixed_codec_round_trip() {
        let mapper = BinMapper::find_bin(&[1.0, 2.0, 2.0, 7.5, -3.0], 10, 16);
        let mut buffer = vec![0u8; BinMapper::size_for_max_bin(16)];
        mapper.copy_to(&mut buffer);
        let back = BinMapper::copy_from(&buffer);
        assert_eq!(mapper, back);
    }

    #[test]
    fn stream_codec_round_trip() {
        let mapper = BinMapper::find_bin(&[0.5, 1.5, 99.0], 3, 8);
        let mut buffer = Vec::new();
        mapper.write_to(&mut buffer).unwrap();
        let back = BinMapper::read_from(&mut &buffer[..]).unwrap();
        assert_eq!(mapper, back);
    }

    #[test]
    fn deterministic_for_identical_samples() {
        let values: Vec<NumT> = (0..500).map(|i| ((i * 7919) % 101) as NumT).collect();
        let a = BinMapper::find_bin(&values, 600, 32);
        let b = BinMapper::find_bin(&values, 600, 32);
        assert_eq!(a, b);
    }
}
