/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::NumT;

/// Per-row side information of a dataset: labels, optional weights, optional
/// query boundaries for ranking, and an optional initial score matrix of shape
/// `num_class x num_data` stored column-major (`score[k * num_data + i]`).
#[derive(Debug)]
pub struct Metadata {
    num_data: usize,
    label: Vec<NumT>,
    weights: Option<Vec<NumT>>,
    query_ids: Option<Vec<u32>>,
    query_boundaries: Option<Vec<usize>>,
    init_score: Option<Vec<NumT>>,
    init_score_classes: usize,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata {
            num_data: 0,
            label: Vec::new(),
            weights: None,
            query_ids: None,
            query_boundaries: None,
            init_score: None,
            init_score_classes: 0,
        }
    }

    /// Allocate the per-row buffers before extraction starts.
    pub fn init(&mut self, num_data: usize, has_weight: bool, has_group: bool) {
        self.num_data = num_data;
        self.label = vec![0.0; num_data];
        self.weights = if has_weight { Some(vec![0.0; num_data]) } else { None };
        self.query_ids = if has_group { Some(vec![0; num_data]) } else { None };
    }

    pub fn num_data(&self) -> usize { self.num_data }
    pub fn label(&self) -> &[NumT] { &self.label }
    pub fn weights(&self) -> Option<&[NumT]> { self.weights.as_ref().map(|w| &w[..]) }
    pub fn init_score(&self) -> Option<&[NumT]> { self.init_score.as_ref().map(|s| &s[..]) }
    pub fn query_boundaries(&self) -> Option<&[usize]> {
        self.query_boundaries.as_ref().map(|q| &q[..])
    }

    pub fn set_label_at(&mut self, i: usize, value: NumT) {
        self.label[i] = value;
    }

    pub fn set_weight_at(&mut self, i: usize, value: NumT) {
        if let Some(weights) = &mut self.weights {
            weights[i] = value;
        }
    }

    pub fn set_query_at(&mut self, i: usize, qid: u32) {
        if let Some(query_ids) = &mut self.query_ids {
            query_ids[i] = qid;
        }
    }

    /// Take ownership of the extractor's initial score buffer,
    /// `num_class * num_data` long.
    pub fn set_init_score(&mut self, scores: Vec<NumT>, num_class: usize) {
        safety_check!(scores.len() == num_class * self.num_data);
        self.init_score = Some(scores);
        self.init_score_classes = num_class;
    }

    /// Convert the per-row query ids collected during extraction into query
    /// boundaries. Query ids must arrive in non-decreasing runs.
    pub fn finish_load(&mut self) -> Result<(), String> {
        if let Some(query_ids) = self.query_ids.take() {
            let mut boundaries = vec![0];
            for i in 1..query_ids.len() {
                if query_ids[i] < query_ids[i - 1] {
                    return Err(format!("query ids are not grouped: id {} follows id {} at row {}",
                               query_ids[i], query_ids[i - 1], i));
                }
                if query_ids[i] != query_ids[i - 1] {
                    boundaries.push(i);
                }
            }
            boundaries.push(query_ids.len());
            self.query_boundaries = Some(boundaries);
        }
        Ok(())
    }

    /// Shrink to the given sorted subset of rows. Query boundaries, when
    /// present, require the subset to cover whole groups.
    pub fn keep_rows(&mut self, used: &[usize]) -> Result<(), String> {
        self.label = used.iter().map(|&i| self.label[i]).collect();
        if let Some(weights) = &self.weights {
            self.weights = Some(used.iter().map(|&i| weights[i]).collect());
        }
        if let Some(scores) = &self.init_score {
            let n = self.num_data;
            let mut subset = Vec::with_capacity(self.init_score_classes * used.len());
            for k in 0..self.init_score_classes {
                subset.extend(used.iter().map(|&i| scores[k * n + i]));
            }
            self.init_score = Some(subset);
        }
        if let Some(boundaries) = &self.query_boundaries {
            let mut new_boundaries = vec![0usize];
            let mut next = 0;
            for q in 0..boundaries.len() - 1 {
                let (start, end) = (boundaries[q], boundaries[q + 1]);
                let mut in_group = 0;
                while next < used.len() && used[next] < end {
                    safety_check!(used[next] >= start);
                    in_group += 1;
                    next += 1;
                }
                if in_group > 0 {
                    if in_group != end - start {
                        return Err(format!("partition split query group {} ({} of {} rows kept)",
                                   q, in_group, end - start));
                    }
                    new_boundaries.push(new_boundaries.last().copied().unwrap_or(0) + in_group);
                }
            }
            self.query_boundaries = Some(new_boundaries);
        }
        self.num_data = used.len();
        Ok(())
    }

    // - Binary blob codec -------------------------------------------------------------------------

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.num_data as u32)?;
        writer.write_u8(self.weights.is_some() as u8)?;
        writer.write_u8(self.query_boundaries.is_some() as u8)?;
        writer.write_u8(self.init_score.is_some() as u8)?;
        writer.write_u32::<LittleEndian>(self.init_score_classes as u32)?;
        for &label in &self.label {
            writer.write_f64::<LittleEndian>(label)?;
        }
        if let Some(weights) = &self.weights {
            for &w in weights {
                writer.write_f64::<LittleEndian>(w)?;
            }
        }
        if let Some(boundaries) = &self.query_boundaries {
            writer.write_u32::<LittleEndian>((boundaries.len() - 1) as u32)?;
            for &b in boundaries {
                writer.write_u32::<LittleEndian>(b as u32)?;
            }
        }
        if let Some(scores) = &self.init_score {
            for &s in scores {
                writer.write_f64::<LittleEndian>(s)?;
            }
        }
        Ok(())
    }

    pub fn load_from_memory(buffer: &[u8]) -> Result<Metadata, String> {
        let mut cursor = Cursor::new(buffer);
        let err = |e: std::io::Error| format!("truncated metadata blob: {}", e);

        let num_data = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
        let has_weights = cursor.read_u8().map_err(err)? != 0;
        let has_boundaries = cursor.read_u8().map_err(err)? != 0;
        let has_init_score = cursor.read_u8().map_err(err)? != 0;
        let init_score_classes = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;

        let mut label = Vec::with_capacity(num_data);
        for _ in 0..num_data {
            label.push(cursor.read_f64::<LittleEndian>().map_err(err)?);
        }
        let weights = if has_weights {
            let mut weights = Vec::with_capacity(num_data);
            for _ in 0..num_data {
                weights.push(cursor.read_f64::<LittleEndian>().map_err(err)?);
            }
            Some(weights)
        } else { None };
        let query_boundaries = if has_boundaries {
            let num_queries = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
            let mut boundaries = Vec::with_capacity(num_queries + 1);
            for _ in 0..=num_queries {
                boundaries.push(cursor.read_u32::<LittleEndian>().map_err(err)? as usize);
            }
            Some(boundaries)
        } else { None };
        let init_score = if has_init_score {
            let len = init_score_classes * num_data;
            let mut scores = Vec::with_capacity(len);
            for _ in 0..len {
                scores.push(cursor.read_f64::<LittleEndian>().map_err(err)?);
            }
            Some(scores)
        } else { None };

        Ok(Metadata {
            num_data,
            label,
            weights,
            query_ids: None,
            query_boundaries,
            init_score,
            init_score_classes,
        })
    }
}




// ------------------------------------------------------------------------------------------------
