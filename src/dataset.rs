/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use rayon::prelude::*;

use crate::NumT;
use crate::feature::Feature;
use crate::metadata::Metadata;

/// Magic/version tag opening every dataset binary; a reader seeing anything
/// else rejects the file.
pub const BINARY_MAGIC: &[u8; 8] = b"BSTLDS01";

/// The product of loading: discretized feature columns plus per-row metadata,
/// rows already restricted to this machine's partition.
#[derive(Debug)]
pub struct Dataset {
    pub(crate) num_data: usize,
    pub(crate) num_total_features: usize,
    pub(crate) used_feature_map: Vec<Option<usize>>,
    pub(crate) feature_names: Vec<String>,
    pub(crate) features: Vec<Feature>,
    pub(crate) metadata: Metadata,
    pub(crate) num_class: usize,
    pub(crate) is_loading_from_binfile: bool,
}

impl Dataset {
    pub(crate) fn new() -> Dataset {
        Dataset {
            num_data: 0,
            num_total_features: 0,
            used_feature_map: Vec::new(),
            feature_names: Vec::new(),
            features: Vec::new(),
            metadata: Metadata::new(),
            num_class: 1,
            is_loading_from_binfile: false,
        }
    }

    pub fn num_data(&self) -> usize { self.num_data }
    pub fn num_class(&self) -> usize { self.num_class }
    pub fn num_features(&self) -> usize { self.features.len() }
    pub fn num_total_features(&self) -> usize { self.num_total_features }
    pub fn feature_names(&self) -> &[String] { &self.feature_names }
    pub fn used_feature_map(&self) -> &[Option<usize>] { &self.used_feature_map }
    pub fn features(&self) -> &[Feature] { &self.features }
    pub fn feature(&self, i: usize) -> &Feature { &self.features[i] }
    pub fn metadata(&self) -> &Metadata { &self.metadata }
    pub fn metadata_mut(&mut self) -> &mut Metadata { &mut self.metadata }
    pub fn is_loading_from_binfile(&self) -> bool { self.is_loading_from_binfile }

    /// Fan one parsed row out to the feature columns it touches. Safe to call
    /// concurrently with disjoint rows and a per-thread `tid`.
    pub fn push_row(&self, tid: usize, row: usize, pairs: &[(usize, NumT)]) {
        for &(c, v) in pairs {
            if c >= self.num_total_features { continue; }
            if let Some(f) = self.used_feature_map[c] {
                self.features[f].push(tid, row, v);
            }
        }
    }

    /// Finalize after extraction: merge every feature's shards and turn the
    /// collected query ids into boundaries.
    pub fn finish_load(&mut self, is_enable_sparse: bool) -> Result<(), String> {
        let num_data = self.num_data;
        self.features.par_iter_mut()
            .for_each(|feature| feature.finish_load(num_data, is_enable_sparse));
        self.metadata.finish_load()
    }

    /// Adopt the bin mappers, feature map and names of an already-built
    /// dataset; used to align a validation set with its training set.
    pub fn copy_feature_mapper_from(&mut self, other: &Dataset, num_threads: usize) {
        self.num_total_features = other.num_total_features;
        self.used_feature_map = other.used_feature_map.clone();
        self.feature_names = other.feature_names.clone();
        self.features = other.features.iter()
            .map(|feature| Feature::new(feature.bin_mapper().clone(), num_threads))
            .collect();
    }

    // - Binary codec, write side ------------------------------------------------------------------

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let path = path.as_ref();
        self.save_binary_inner(path)
            .map_err(|err| format!("cannot write dataset binary {}: {}", path.display(), err))?;
        info!("saved dataset binary to {}", path.display());
        Ok(())
    }

    fn save_binary_inner(&self, path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(BINARY_MAGIC)?;

        let mut blob = Vec::new();
        blob.write_u32::<LittleEndian>(self.num_data as u32)?;
        blob.write_i32::<LittleEndian>(self.num_class as i32)?;
        blob.write_i32::<LittleEndian>(self.features.len() as i32)?;
        blob.write_i32::<LittleEndian>(self.num_total_features as i32)?;
        blob.write_u64::<LittleEndian>(self.used_feature_map.len() as u64)?;
        for &mapped in &self.used_feature_map {
            blob.write_i32::<LittleEndian>(mapped.map_or(-1, |f| f as i32))?;
        }
        for name in &self.feature_names {
            blob.write_i32::<LittleEndian>(name.len() as i32)?;
            blob.write_all(name.as_bytes())?;
        }
        writer.write_u64::<LittleEndian>(blob.len() as u64)?;
        writer.write_all(&blob)?;

        blob.clear();
        self.metadata.write_to(&mut blob)?;
        writer.write_u64::<LittleEndian>(blob.len() as u64)?;
        writer.write_all(&blob)?;

        for feature in &self.features {
            blob.clear();
            feature.write_to(&mut blob)?;
            writer.write_u64::<LittleEndian>(blob.len() as u64)?;
            writer.write_all(&blob)?;
        }
        writer.flush()
    }
}

/// Read one size-prefixed blob into the scratch buffer, growing it first when
/// the blob is larger than the buffer.
pub(crate) fn read_blob<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<usize, String> {
    let size = reader.read_u64::<LittleEndian>()
        .map_err(|err| format!("truncated dataset binary: {}", err))? as usize;
    if buffer.len() < size {
        buffer.resize(size, 0);
    }
    reader.read_exact(&mut buffer[..size])
        .map_err(|err| format!("truncated dataset binary: {}", err))?;
    Ok(size)
}




// ------------------------------------------------------------------------------------------------
