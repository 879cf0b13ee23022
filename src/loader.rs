/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{NumT, ZERO_EPS};
use crate::binner::BinMapper;
use crate::config::Config;
use crate::dataset::{read_blob, Dataset, BINARY_MAGIC};
use crate::feature::Feature;
use crate::metadata::Metadata;
use crate::network::{sync_up_by_max, Allgather};
use crate::parser::{parse_header, RowParser};
use crate::reader::{TextReader, BLOCK_SIZE};
use crate::sampler::{GroupPartitionFilter, PartitionFilter, RowPartitionFilter, Sampler};

/// Computes an initial `num_class`-dimensional score from a parsed row.
pub type PredictFunction = Box<dyn Fn(&[(usize, NumT)], &mut [NumT]) + Send + Sync>;

/// Fixed-slot marker for a column without a bin mapper in the distributed
/// exchange (ignored on the owning machine).
const NO_MAPPER_TAG: u32 = std::u32::MAX;

struct ParsedRow {
    pairs: Vec<(usize, NumT)>,
    label: NumT,
    scores: Vec<NumT>,
}

/// Builds a `Dataset` out of a text file, a dataset binary, or caller-supplied
/// samples. Column roles are resolved once, on the first file touched; the
/// loader can then be reused, e.g. to align validation files with a training
/// set.
pub struct DatasetLoader<'a> {
    config: &'a Config,
    predict_fun: Option<PredictFunction>,
    network: Option<&'a dyn Allgather>,
    resolved: bool,
    label_idx: usize,
    weight_idx: Option<usize>,
    group_idx: Option<usize>,
    ignore_features: FnvHashSet<usize>,
    feature_names: Vec<String>,
}

impl<'a> DatasetLoader<'a> {
    pub fn new(config: &'a Config) -> DatasetLoader<'a> {
        DatasetLoader {
            config,
            predict_fun: None,
            network: None,
            resolved: false,
            label_idx: 0,
            weight_idx: None,
            group_idx: None,
            ignore_features: FnvHashSet::default(),
            feature_names: Vec::new(),
        }
    }

    /// Install the function that scores rows into `metadata.init_score`.
    pub fn with_predict_fun(mut self, predict_fun: PredictFunction) -> DatasetLoader<'a> {
        self.predict_fun = Some(predict_fun);
        self
    }

    /// Required for `load_from_file` with more than one machine.
    pub fn with_network(mut self, network: &'a dyn Allgather) -> DatasetLoader<'a> {
        self.network = Some(network);
        self
    }

    pub fn label_idx(&self) -> usize { self.label_idx }
    pub fn weight_idx(&self) -> Option<usize> { self.weight_idx }
    pub fn group_idx(&self) -> Option<usize> { self.group_idx }
    pub fn ignore_features(&self) -> &FnvHashSet<usize> { &self.ignore_features }
    pub fn feature_names(&self) -> &[String] { &self.feature_names }

    // - Entry flows -------------------------------------------------------------------------------

    /// Load training data: from the `.bin` cache next to `filename` when one
    /// exists, from the text file otherwise. With `num_machines > 1` and no
    /// pre-partitioning, this machine keeps only the rows the shared seed
    /// assigns to `rank`.
    pub fn load_from_file(&mut self, filename: &str, rank: usize, num_machines: usize)
        -> Result<Dataset, String>
    {
        let reader = TextReader::new(filename, self.config.has_header)?;
        let header = if self.config.has_header {
            Some(reader.first_line().to_string())
        } else {
            None
        };
        self.resolve_column_roles(header.as_ref().map(|h| h.as_str()))?;

        if num_machines > 1 && !self.config.is_pre_partition && self.group_idx.is_some() {
            return Err("an in-data group column requires pre-partitioned input for \
                        distributed training".to_string());
        }

        let bin_filename = format!("{}.bin", filename);
        if Path::new(&bin_filename).exists() {
            info!("found dataset binary {}, the text file is not read", bin_filename);
            let dataset = self.load_from_binary(&bin_filename, rank, num_machines)?;
            self.check_dataset(&dataset)?;
            return Ok(dataset);
        }

        let dataset = if self.config.use_two_round_loading {
            self.load_two_round(&reader, rank, num_machines)?
        } else {
            self.load_in_memory(&reader, rank, num_machines)?
        };
        self.check_dataset(&dataset)?;
        Ok(dataset)
    }

    /// Load a validation file aligned with an already-built training set: one
    /// machine's view, bin mappers copied from `train` instead of learned, and
    /// no validation of the result.
    pub fn load_from_file_aligned_with(&mut self, filename: &str, train: &Dataset)
        -> Result<Dataset, String>
    {
        let reader = TextReader::new(filename, self.config.has_header)?;
        let header = if self.config.has_header {
            Some(reader.first_line().to_string())
        } else {
            None
        };
        self.resolve_column_roles(header.as_ref().map(|h| h.as_str()))?;

        let bin_filename = format!("{}.bin", filename);
        if Path::new(&bin_filename).exists() {
            info!("found dataset binary {}, the text file is not read", bin_filename);
            return self.load_from_binary(&bin_filename, 0, 1);
        }

        let (mut lines, _) = reader.read_all_lines()?;
        let num_data = lines.len();
        let mut sampler = Sampler::new(self.config.data_random_seed);
        let sample_indices = sampler
            .choose_indices(num_data, self.config.bin_construct_sample_cnt);
        let sample_lines: Vec<&str> = sample_indices.iter().map(|&i| lines[i].as_str()).collect();
        let parser = RowParser::detect(&sample_lines, self.label_idx)?;

        let mut dataset = Dataset::new();
        dataset.num_data = num_data;
        dataset.num_class = self.config.num_class;
        dataset.copy_feature_mapper_from(train, rayon::current_num_threads());
        dataset.metadata.init(num_data, self.weight_idx.is_some(), self.group_idx.is_some());
        self.extract_features_from_memory(&mut lines, &parser, &mut dataset)?;
        Ok(dataset)
    }

    /// Build a dataset straight from per-feature sample arrays, bypassing text
    /// entirely. The returned dataset is ready for `push_row` calls for rows
    /// `0..num_data`, followed by `finish_load`.
    pub fn construct_from_sample_data(&mut self, sample_values: &[Vec<NumT>],
                                      total_sample_cnt: usize, num_data: usize)
        -> Result<Dataset, String>
    {
        let max_bin = self.config.max_bin;
        let ignore = &self.ignore_features;
        let bin_mappers: Vec<Option<BinMapper>> = sample_values.par_iter().enumerate()
            .map(|(c, values)| {
                if ignore.contains(&c) {
                    None
                } else {
                    Some(BinMapper::find_bin(values, total_sample_cnt, max_bin))
                }
            })
            .collect();

        let num_total_features = sample_values.len();
        let feature_names = self.feature_names_for(num_total_features);
        let mut dataset = self.assemble_dataset(bin_mappers, feature_names, num_total_features);
        dataset.num_data = num_data;
        dataset.num_class = self.config.num_class;
        dataset.metadata.init(num_data, false, false);
        Ok(dataset)
    }

    // - Column role resolution --------------------------------------------------------------------

    fn resolve_column_roles(&mut self, header: Option<&str>) -> Result<(), String> {
        if self.resolved { return Ok(()); }

        let names: Vec<String> = match header {
            Some(line) => parse_header(line)?,
            None => Vec::new(),
        };
        let mut name_to_idx = FnvHashMap::default();
        for (i, name) in names.iter().enumerate() {
            name_to_idx.insert(name.as_str(), i);
        }

        self.label_idx = if self.config.label_column.is_empty() {
            0
        } else {
            resolve_role("label", &self.config.label_column, &name_to_idx)?
        };
        if !names.is_empty() {
            if self.label_idx >= names.len() {
                return Err(format!("label column {} is out of range for {} columns",
                           self.label_idx, names.len()));
            }
            info!("using column '{}' as the label", names[self.label_idx]);
        }
        // feature_names[i] corresponds to feature index i once the label is out
        self.feature_names = names.iter().enumerate()
            .filter(|&(i, _)| i != self.label_idx)
            .map(|(_, name)| name.clone())
            .collect();

        if !self.config.weight_column.is_empty() {
            let column = resolve_role("weight", &self.config.weight_column, &name_to_idx)?;
            let idx = self.shift_past_label("weight", column)?;
            info!("using column {} as weights", column);
            self.weight_idx = Some(idx);
            self.ignore_features.insert(idx);
        }
        if !self.config.group_column.is_empty() {
            let column = resolve_role("group", &self.config.group_column, &name_to_idx)?;
            let idx = self.shift_past_label("group", column)?;
            info!("using column {} as query groups", column);
            self.group_idx = Some(idx);
            self.ignore_features.insert(idx);
        }
        if !self.config.ignore_column.is_empty() {
            let list = &self.config.ignore_column;
            let columns: Vec<usize> = if list.starts_with("name:") {
                list[5..].split(',')
                    .map(|name| {
                        name_to_idx.get(name.trim()).copied().ok_or_else(|| {
                            format!("could not find ignored column '{}' in the data header",
                                    name.trim())
                        })
                    })
                    .collect::<Result<_, _>>()?
            } else {
                list.split(',')
                    .map(|token| {
                        token.trim().parse::<usize>().map_err(|_| {
                            format!("ignored column '{}' is not a column index; use a single \
                                     'name:' prefix to select the whole list by header name",
                                    token.trim())
                        })
                    })
                    .collect::<Result<_, _>>()?
            };
            for column in columns {
                let idx = self.shift_past_label("ignored", column)?;
                debug!("ignoring column {}", column);
                self.ignore_features.insert(idx);
            }
        }

        self.resolved = true;
        Ok(())
    }

    /// Original column number to post-label-removal feature index.
    fn shift_past_label(&self, kind: &str, column: usize) -> Result<usize, String> {
        if column == self.label_idx {
            return Err(format!("{} column {} is already the label column", kind, column));
        }
        Ok(if column > self.label_idx { column - 1 } else { column })
    }

    // - Text loading ------------------------------------------------------------------------------

    fn load_in_memory(&mut self, reader: &TextReader, rank: usize, num_machines: usize)
        -> Result<Dataset, String>
    {
        let seed = self.config.data_random_seed;
        let mut used_data_indices = Vec::new();
        let (mut lines, num_global_data) =
            if num_machines <= 1 || self.config.is_pre_partition {
                reader.read_all_lines()?
            } else {
                let mut filter = RowPartitionFilter::new(seed, rank, num_machines);
                reader.read_and_filter_lines(&mut filter, &mut used_data_indices)?
            };
        let num_data = lines.len();
        info!("loaded {} of {} rows into memory", num_data, num_global_data);
        if num_data == 0 {
            return Err(format!("no data rows on machine {} of {} (global count {})",
                       rank, num_machines, num_global_data));
        }

        let mut sampler = Sampler::new(seed);
        let sample_indices = sampler
            .choose_indices(num_data, self.config.bin_construct_sample_cnt);
        let sample_lines: Vec<&str> = sample_indices.iter().map(|&i| lines[i].as_str()).collect();
        let parser = RowParser::detect(&sample_lines, self.label_idx)?;

        let mut dataset = self.construct_bin_mappers(&parser, &sample_lines, rank, num_machines)?;
        dataset.num_data = num_data;
        dataset.num_class = self.config.num_class;
        dataset.metadata.init(num_data, self.weight_idx.is_some(), self.group_idx.is_some());
        self.extract_features_from_memory(&mut lines, &parser, &mut dataset)?;
        Ok(dataset)
    }

    fn load_two_round(&mut self, reader: &TextReader, rank: usize, num_machines: usize)
        -> Result<Dataset, String>
    {
        let seed = self.config.data_random_seed;
        let sample_cnt = self.config.bin_construct_sample_cnt;
        let full_read = num_machines <= 1 || self.config.is_pre_partition;
        let mut used_data_indices = Vec::new();
        let mut sampler = Sampler::new(seed);
        let (sample_lines, num_global_data) = if full_read {
            reader.sample_from_file(&mut sampler, sample_cnt)?
        } else {
            let mut filter = RowPartitionFilter::new(seed, rank, num_machines);
            reader.sample_and_filter_from_file(&mut filter, &mut used_data_indices,
                                               &mut sampler, sample_cnt)?
        };
        let num_data = if full_read { num_global_data } else { used_data_indices.len() };
        info!("two-round loading: {} rows total, {} on this machine, {} sampled",
              num_global_data, num_data, sample_lines.len());
        if num_data == 0 {
            return Err(format!("no data rows on machine {} of {} (global count {})",
                       rank, num_machines, num_global_data));
        }

        let sample_refs: Vec<&str> = sample_lines.iter().map(|line| line.as_str()).collect();
        let parser = RowParser::detect(&sample_refs, self.label_idx)?;

        let mut dataset = self.construct_bin_mappers(&parser, &sample_refs, rank, num_machines)?;
        dataset.num_data = num_data;
        dataset.num_class = self.config.num_class;
        dataset.metadata.init(num_data, self.weight_idx.is_some(), self.group_idx.is_some());
        self.extract_features_from_file(reader, &parser, &used_data_indices, &mut dataset)?;
        Ok(dataset)
    }

    // - Bin mapper construction -------------------------------------------------------------------

    fn construct_bin_mappers(&self, parser: &RowParser, sample_lines: &[&str],
                             rank: usize, num_machines: usize)
        -> Result<Dataset, String>
    {
        let parsed: Vec<Vec<(usize, NumT)>> = sample_lines.par_iter()
            .map(|line| {
                let mut pairs = Vec::new();
                let mut label = 0.0;
                parser.parse_one_line(line, &mut pairs, &mut label)?;
                Ok(pairs)
            })
            .collect::<Result<Vec<_>, String>>()?;

        // ragged per-column value sample; explicit zeros and absent cells alike
        // stay out of the quantile statistics
        let mut sample_values: Vec<Vec<NumT>> = Vec::new();
        for pairs in &parsed {
            for &(c, v) in pairs {
                if c >= sample_values.len() {
                    sample_values.resize(c + 1, Vec::new());
                }
                if v.abs() > ZERO_EPS {
                    sample_values[c].push(v);
                }
            }
        }

        let mut num_total_features = usize::max(sample_values.len(), self.feature_names.len());
        if num_machines > 1 {
            let network = self.require_network(num_machines)?;
            num_total_features = sync_up_by_max(network, num_total_features as u32)? as usize;
        }
        sample_values.resize(num_total_features, Vec::new());
        let feature_names = self.feature_names_for(num_total_features);

        let total_sample_cnt = sample_lines.len();
        let max_bin = self.config.max_bin;
        let ignore = &self.ignore_features;
        let bin_mappers: Vec<Option<BinMapper>> = if num_machines <= 1 {
            (0..num_total_features).into_par_iter()
                .map(|c| {
                    if ignore.contains(&c) {
                        None
                    } else {
                        Some(BinMapper::find_bin(&sample_values[c], total_sample_cnt, max_bin))
                    }
                })
                .collect()
        } else {
            self.construct_bin_mappers_distributed(&sample_values, total_sample_cnt,
                                                   rank, num_machines)?
        };

        Ok(self.assemble_dataset(bin_mappers, feature_names, num_total_features))
    }

    /// Each machine learns the bin mappers of its contiguous column shard and a
    /// single allgather hands every machine every mapper.
    fn construct_bin_mappers_distributed(&self, sample_values: &[Vec<NumT>],
                                         total_sample_cnt: usize,
                                         rank: usize, num_machines: usize)
        -> Result<Vec<Option<BinMapper>>, String>
    {
        let network = self.require_network(num_machines)?;
        let num_total_features = sample_values.len();
        let max_bin = self.config.max_bin;
        let type_size = BinMapper::size_for_max_bin(max_bin);

        // contiguous shards by ceil division, the last one absorbs the remainder
        let per_machine = (num_total_features + num_machines - 1) / num_machines;
        let starts: Vec<usize> = (0..num_machines)
            .map(|m| usize::min(m * per_machine, num_total_features))
            .collect();
        let lens: Vec<usize> = (0..num_machines)
            .map(|m| usize::min((m + 1) * per_machine, num_total_features) - starts[m])
            .collect();

        let my_start = starts[rank];
        let my_len = lens[rank];
        let ignore = &self.ignore_features;
        let my_mappers: Vec<Option<BinMapper>> = (my_start..my_start + my_len).into_par_iter()
            .map(|c| {
                if ignore.contains(&c) {
                    None
                } else {
                    Some(BinMapper::find_bin(&sample_values[c], total_sample_cnt, max_bin))
                }
            })
            .collect();

        let mut input = vec![0u8; my_len * type_size];
        for (slot, mapper) in my_mappers.iter().enumerate() {
            let buffer = &mut input[slot * type_size..(slot + 1) * type_size];
            match mapper {
                Some(mapper) => mapper.copy_to(buffer),
                None => LittleEndian::write_u32(&mut buffer[..4], NO_MAPPER_TAG),
            }
        }

        let byte_starts: Vec<usize> = starts.iter().map(|&s| s * type_size).collect();
        let byte_lens: Vec<usize> = lens.iter().map(|&l| l * type_size).collect();
        let mut output = vec![0u8; num_total_features * type_size];
        network.allgather(&input, &byte_starts, &byte_lens, &mut output)?;

        Ok((0..num_total_features)
            .map(|c| {
                let slot = &output[c * type_size..(c + 1) * type_size];
                if LittleEndian::read_u32(&slot[..4]) == NO_MAPPER_TAG {
                    None
                } else {
                    Some(BinMapper::copy_from(slot))
                }
            })
            .collect())
    }

    /// Drop ignored and trivial columns, assign the surviving ones ascending
    /// feature indices.
    fn assemble_dataset(&self, bin_mappers: Vec<Option<BinMapper>>,
                        feature_names: Vec<String>, num_total_features: usize)
        -> Dataset
    {
        let num_threads = rayon::current_num_threads();
        let mut dataset = Dataset::new();
        dataset.num_total_features = num_total_features;
        dataset.used_feature_map = vec![None; num_total_features];
        for (c, mapper) in bin_mappers.into_iter().enumerate() {
            match mapper {
                None => debug!("column {} ({}) is ignored", c, feature_names[c]),
                Some(mapper) => {
                    if mapper.is_trivial() {
                        warn!("column {} ({}) has a single value in the sample; dropping it",
                              c, feature_names[c]);
                    } else {
                        dataset.used_feature_map[c] = Some(dataset.features.len());
                        dataset.features.push(Feature::new(mapper, num_threads));
                    }
                },
            }
        }
        dataset.feature_names = feature_names;
        dataset
    }

    fn feature_names_for(&self, num_total_features: usize) -> Vec<String> {
        let mut names = self.feature_names.clone();
        for i in names.len()..num_total_features {
            names.push(format!("Column_{}", i));
        }
        names
    }

    fn require_network(&self, num_machines: usize) -> Result<&dyn Allgather, String> {
        let network = self.network.ok_or_else(|| {
            format!("distributed loading over {} machines requires a network", num_machines)
        })?;
        if network.num_machines() != num_machines {
            return Err(format!("network spans {} machines, caller says {}",
                       network.num_machines(), num_machines));
        }
        Ok(network)
    }

    // - Feature extraction ------------------------------------------------------------------------

    fn extract_features_from_memory(&self, lines: &mut Vec<String>, parser: &RowParser,
                                    dataset: &mut Dataset)
        -> Result<(), String>
    {
        let mut init_score = self.predict_fun.as_ref()
            .map(|_| vec![0.0; dataset.num_class * dataset.num_data]);
        let mut start_idx = 0;
        while start_idx < lines.len() {
            let end = usize::min(start_idx + BLOCK_SIZE, lines.len());
            self.extract_block(dataset, parser, start_idx, &mut lines[start_idx..end],
                               &mut init_score)?;
            start_idx = end;
        }
        if let Some(scores) = init_score {
            let num_class = dataset.num_class;
            dataset.metadata.set_init_score(scores, num_class);
        }
        dataset.finish_load(self.config.is_enable_sparse)
    }

    fn extract_features_from_file(&self, reader: &TextReader, parser: &RowParser,
                                  used_data_indices: &[usize], dataset: &mut Dataset)
        -> Result<(), String>
    {
        let mut init_score = self.predict_fun.as_ref()
            .map(|_| vec![0.0; dataset.num_class * dataset.num_data]);
        if used_data_indices.is_empty() {
            reader.read_all_and_process_parallel(|start_idx, block| {
                self.extract_block(dataset, parser, start_idx, block, &mut init_score)
            })?;
        } else {
            reader.read_part_and_process_parallel(used_data_indices, |start_idx, block| {
                self.extract_block(dataset, parser, start_idx, block, &mut init_score)
            })?;
        }
        if let Some(scores) = init_score {
            let num_class = dataset.num_class;
            dataset.metadata.set_init_score(scores, num_class);
        }
        dataset.finish_load(self.config.is_enable_sparse)
    }

    /// One block of rows: parse in parallel, write the per-row metadata on the
    /// orchestrator thread, fan the feature values out in parallel, release
    /// the text.
    fn extract_block(&self, dataset: &mut Dataset, parser: &RowParser, start_idx: usize,
                     lines: &mut [String], init_score: &mut Option<Vec<NumT>>)
        -> Result<(), String>
    {
        let num_class = dataset.num_class;
        let num_data = dataset.num_data;
        let predict_fun = self.predict_fun.as_ref();
        let parsed: Vec<ParsedRow> = lines.par_iter()
            .map(|line| {
                let mut pairs = Vec::new();
                let mut label = 0.0;
                parser.parse_one_line(line, &mut pairs, &mut label)?;
                let mut scores = Vec::new();
                if let Some(predict) = predict_fun {
                    scores.resize(num_class, 0.0);
                    predict(&pairs, &mut scores);
                }
                Ok(ParsedRow { pairs, label, scores })
            })
            .collect::<Result<Vec<_>, String>>()?;

        for (j, row) in parsed.iter().enumerate() {
            let i = start_idx + j;
            dataset.metadata.set_label_at(i, row.label);
            if self.weight_idx.is_some() || self.group_idx.is_some() {
                for &(c, v) in &row.pairs {
                    if Some(c) == self.weight_idx {
                        dataset.metadata.set_weight_at(i, v);
                    } else if Some(c) == self.group_idx {
                        dataset.metadata.set_query_at(i, v as u32);
                    }
                }
            }
            if let Some(scores) = init_score.as_mut() {
                for k in 0..num_class {
                    scores[k * num_data + i] = row.scores[k];
                }
            }
        }

        let dataset_ref: &Dataset = dataset;
        parsed.par_iter().enumerate().for_each(|(j, row)| {
            let tid = rayon::current_thread_index().unwrap_or(0);
            dataset_ref.push_row(tid, start_idx + j, &row.pairs);
        });

        for line in lines.iter_mut() {
            line.clear();
            line.shrink_to_fit();
        }
        Ok(())
    }

    // - Binary codec, read side -------------------------------------------------------------------

    fn load_from_binary(&mut self, bin_filename: &str, rank: usize, num_machines: usize)
        -> Result<Dataset, String>
    {
        let file = File::open(bin_filename)
            .map_err(|err| format!("cannot open dataset binary {}: {}", bin_filename, err))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)
            .map_err(|err| format!("truncated dataset binary {}: {}", bin_filename, err))?;
        if &magic != BINARY_MAGIC {
            return Err(format!("{} is not a dataset binary with the expected layout",
                       bin_filename));
        }

        let mut buffer = Vec::new();
        let size = read_blob(&mut reader, &mut buffer)?;
        let header = parse_binary_header(&buffer[..size])?;

        let size = read_blob(&mut reader, &mut buffer)?;
        let mut metadata = Metadata::load_from_memory(&buffer[..size])?;

        // the binary holds the full dataset; a distributed, non-pre-partitioned
        // reload re-draws this machine's share with the shared seed
        let repartition = num_machines > 1 && !self.config.is_pre_partition;
        let mut used_data_indices: Vec<usize> = Vec::new();
        if repartition {
            let seed = self.config.data_random_seed;
            let mut filter: Box<dyn PartitionFilter> = match metadata.query_boundaries() {
                Some(boundaries) => Box::new(GroupPartitionFilter::new(
                    seed, rank, num_machines, boundaries.to_vec())),
                None => Box::new(RowPartitionFilter::new(seed, rank, num_machines)),
            };
            for i in 0..header.num_data {
                if filter.should_keep(i)? {
                    used_data_indices.push(i);
                }
            }
            info!("re-partitioned dataset binary: keeping {} of {} rows",
                  used_data_indices.len(), header.num_data);
            if used_data_indices.is_empty() {
                return Err(format!("no data rows on machine {} of {} (global count {})",
                           rank, num_machines, header.num_data));
            }
            metadata.keep_rows(&used_data_indices)?;
        }
        let num_data = if repartition { used_data_indices.len() } else { header.num_data };

        let mut features = Vec::with_capacity(header.num_features);
        for _ in 0..header.num_features {
            let size = read_blob(&mut reader, &mut buffer)?;
            features.push(Feature::read_from(&buffer[..size], header.num_data,
                                             &used_data_indices)?);
        }

        safety_check!(header.used_feature_map.iter().filter(|m| m.is_some()).count()
                      == features.len());
        Ok(Dataset {
            num_data,
            num_total_features: header.num_total_features,
            used_feature_map: header.used_feature_map,
            feature_names: header.feature_names,
            features,
            metadata,
            num_class: header.num_class,
            is_loading_from_binfile: true,
        })
    }

    // - Validation --------------------------------------------------------------------------------

    fn check_dataset(&self, dataset: &Dataset) -> Result<(), String> {
        if dataset.num_data == 0 {
            return Err("cannot construct a dataset with zero rows".to_string());
        }
        if dataset.features.is_empty() {
            return Err("no usable feature columns: all are ignored or single-valued".to_string());
        }
        Ok(())
    }
}

fn resolve_role(kind: &str, column: &str, name_to_idx: &FnvHashMap<&str, usize>)
    -> Result<usize, String>
{
    if column.starts_with("name:") {
        let name = &column[5..];
        name_to_idx.get(name).copied().ok_or_else(|| {
            format!("could not find {} column '{}' in the data header", kind, name)
        })
    } else {
        column.parse::<usize>().map_err(|_| {
            format!("{} column '{}' is not a column index; use the 'name:' prefix to select \
                     by header name", kind, column)
        })
    }
}

struct BinaryHeader {
    num_data: usize,
    num_class: usize,
    num_features: usize,
    num_total_features: usize,
    used_feature_map: Vec<Option<usize>>,
    feature_names: Vec<String>,
}

fn parse_binary_header(buffer: &[u8]) -> Result<BinaryHeader, String> {
    let mut cursor = Cursor::new(buffer);
    let err = |e: std::io::Error| format!("truncated dataset binary header: {}", e);

    let num_data = cursor.read_u32::<LittleEndian>().map_err(err)? as usize;
    let num_class = cursor.read_i32::<LittleEndian>().map_err(err)? as usize;
    let num_features = cursor.read_i32::<LittleEndian>().map_err(err)? as usize;
    let num_total_features = cursor.read_i32::<LittleEndian>().map_err(err)? as usize;
    let map_len = cursor.read_u64::<LittleEndian>().map_err(err)? as usize;
    let mut used_feature_map = Vec::with_capacity(map_len);
    for _ in 0..map_len {
        let mapped = cursor.read_i32::<LittleEndian>().map_err(err)?;
        used_feature_map.push(if mapped < 0 { None } else { Some(mapped as usize) });
    }
    let mut feature_names = Vec::with_capacity(num_total_features);
    for _ in 0..num_total_features {
        let name_len = cursor.read_i32::<LittleEndian>().map_err(err)? as usize;
        let mut bytes = vec![0u8; name_len];
        cursor.read_exact(&mut bytes).map_err(err)?;
        feature_names.push(String::from_utf8(bytes)
            .map_err(|e| format!("invalid feature name in dataset binary: {}", e))?);
    }
    Ok(BinaryHeader {
        num_data,
        num_class,
        num_features,
        num_total_features,
        used_feature_map,
        feature_names,
    })
}




// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use crate::network::InProcessNetwork;
    use super::*;

    fn data_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("boostload_loader_{}_{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        // a stale binary from an earlier run must not hijack the test
        let _ = fs::remove_file(format!("{}.bin", path.display()));
        path
    }

    fn load(config: &Config, path: &PathBuf) -> Result<Dataset, String> {
        DatasetLoader::new(config).load_from_file(path.to_str().unwrap(), 0, 1)
    }

    fn names_of(dataset: &Dataset) -> Vec<&str> {
        dataset.feature_names().iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn basic_csv_with_header() {
        let path = data_file("basic.csv", "a,b,c,label\n1,2,3,0\n4,5,6,1\n7,8,9,0\n");
        let mut config = Config::new();
        config.has_header = true;
        config.label_column = "name:label".to_string();
        config.max_bin = 16;

        let mut loader = DatasetLoader::new(&config);
        let dataset = loader.load_from_file(path.to_str().unwrap(), 0, 1).unwrap();

        assert_eq!(loader.label_idx(), 3);
        assert_eq!(dataset.num_data(), 3);
        assert_eq!(dataset.num_total_features(), 3);
        assert_eq!(dataset.num_features(), 3);
        assert_eq!(names_of(&dataset), vec!["a", "b", "c"]);
        assert_eq!(dataset.metadata().label(), &[0.0, 1.0, 0.0]);
        assert!(!dataset.is_loading_from_binfile());
        // row values increase down each column, so bins must too
        for f in 0..3 {
            let feature = dataset.feature(f);
            assert!(feature.bin(0) < feature.bin(1));
            assert!(feature.bin(1) < feature.bin(2));
        }
    }

    #[test]
    fn ignore_by_name_with_label_shift() {
        let path = data_file("roles.csv",
            "id,x,y,label,w\n1,0.5,2.0,0,1.0\n2,0.6,3.0,1,2.0\n3,0.7,4.0,0,1.5\n");
        let mut config = Config::new();
        config.has_header = true;
        config.label_column = "name:label".to_string();
        config.weight_column = "name:w".to_string();
        config.ignore_column = "name:id".to_string();

        let mut loader = DatasetLoader::new(&config);
        let dataset = loader.load_from_file(path.to_str().unwrap(), 0, 1).unwrap();

        assert_eq!(loader.label_idx(), 3);
        assert_eq!(loader.weight_idx(), Some(3));
        assert!(loader.ignore_features().contains(&0));
        assert!(loader.ignore_features().contains(&3));
        let names: Vec<&str> = loader.feature_names().iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["id", "x", "y", "w"]);

        assert_eq!(dataset.num_total_features(), 4);
        assert_eq!(dataset.num_features(), 2);
        assert_eq!(dataset.used_feature_map().to_vec(), vec![None, Some(0), Some(1), None]);
        assert_eq!(dataset.metadata().weights().unwrap(), &[1.0, 2.0, 1.5]);
        assert_eq!(dataset.metadata().label(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn trivial_column_is_dropped() {
        let path = data_file("trivial.csv", "5,1,0\n5,2,1\n5,3,0\n");
        let mut config = Config::new();
        config.label_column = "2".to_string();

        let dataset = load(&config, &path).unwrap();
        assert_eq!(dataset.num_total_features(), 2);
        assert_eq!(dataset.num_features(), 1);
        assert_eq!(dataset.used_feature_map().to_vec(), vec![None, Some(0)]);
        assert_eq!(dataset.metadata().label(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn synthetic_feature_names_without_header() {
        let path = data_file("no_header.csv", "0,1,2\n1,3,4\n");
        let config = Config::new(); // label defaults to column 0
        let dataset = load(&config, &path).unwrap();
        assert_eq!(names_of(&dataset), vec!["Column_0", "Column_1"]);
        assert_eq!(dataset.metadata().label(), &[0.0, 1.0]);
    }

    #[test]
    fn unknown_role_name_is_fatal() {
        let path = data_file("bad_name.csv", "a,b\n1,2\n");
        let mut config = Config::new();
        config.has_header = true;
        config.label_column = "name:nope".to_string();
        let err = load(&config, &path).unwrap_err();
        assert!(err.contains("nope"), "{}", err);
    }

    #[test]
    fn non_integer_role_without_prefix_is_fatal() {
        let path = data_file("bad_idx.csv", "a,b\n1,2\n");
        let mut config = Config::new();
        config.has_header = true;
        config.label_column = "b".to_string();
        let err = load(&config, &path).unwrap_err();
        assert!(err.contains("name:"), "{}", err);
    }

    #[test]
    fn group_column_needs_pre_partition_when_distributed() {
        let path = data_file("group_dist.csv", "0,1,0\n1,2,0\n");
        let mut config = Config::new();
        config.group_column = "2".to_string();
        let err = DatasetLoader::new(&config)
            .load_from_file(path.to_str().unwrap(), 0, 2)
            .unwrap_err();
        assert!(err.contains("pre-partition"), "{}", err);
    }

    #[test]
    fn all_trivial_features_is_fatal() {
        let path = data_file("all_trivial.csv", "5,5,0\n5,5,1\n");
        let mut config = Config::new();
        config.label_column = "2".to_string();
        let err = load(&config, &path).unwrap_err();
        assert!(err.contains("usable"), "{}", err);
    }

    #[test]
    fn empty_file_is_fatal() {
        let path = data_file("empty.csv", "");
        let config = Config::new();
        assert!(load(&config, &path).is_err());
    }

    #[test]
    fn libsvm_rows_load_sparsely() {
        let path = data_file("sparse.txt", "1 0:1.5 2:3.0\n0 1:2.5\n1 0:2.0 2:4.0\n");
        let config = Config::new();
        let dataset = load(&config, &path).unwrap();

        assert_eq!(dataset.num_data(), 3);
        assert_eq!(dataset.num_total_features(), 3);
        assert_eq!(dataset.num_features(), 3);
        assert_eq!(dataset.metadata().label(), &[1.0, 0.0, 1.0]);
        // column 1 is zero except in row 1
        let f1 = dataset.used_feature_map()[1].unwrap();
        let feature = dataset.feature(f1);
        assert_eq!(feature.bin(0), feature.bin(2));
        assert!(feature.bin(1) > feature.bin(0));
    }

    #[test]
    fn two_round_loading_matches_in_memory() {
        let contents: String = (0..20)
            .map(|i| format!("{},{},{}\n", i % 2, (i * 7) % 10, (i * 3) % 5))
            .collect();
        let path = data_file("two_round.csv", &contents);

        let config = Config::new();
        let in_memory = load(&config, &path).unwrap();

        let mut config2 = Config::new();
        config2.use_two_round_loading = true;
        let two_round = load(&config2, &path).unwrap();

        assert_eq!(in_memory.num_data(), two_round.num_data());
        assert_eq!(in_memory.num_features(), two_round.num_features());
        assert_eq!(in_memory.metadata().label(), two_round.metadata().label());
        for f in 0..in_memory.num_features() {
            assert_eq!(in_memory.feature(f).bin_mapper(), two_round.feature(f).bin_mapper());
            for row in 0..in_memory.num_data() {
                assert_eq!(in_memory.feature(f).bin(row), two_round.feature(f).bin(row));
            }
        }
    }

    #[test]
    fn predict_fun_fills_init_score() {
        let path = data_file("init_score.csv", "0,1,2\n1,3,4\n0,5,6\n1,7,8\n");
        let mut config = Config::new();
        config.num_class = 2;
        let mut loader = DatasetLoader::new(&config)
            .with_predict_fun(Box::new(|_pairs, out| {
                out[0] = 0.25;
                out[1] = 0.75;
            }));
        let dataset = loader.load_from_file(path.to_str().unwrap(), 0, 1).unwrap();

        let scores = dataset.metadata().init_score().unwrap();
        assert_eq!(scores.len(), 8);
        assert_eq!(&scores[..4], &[0.25; 4]); // class 0, column-major
        assert_eq!(&scores[4..], &[0.75; 4]); // class 1
    }

    #[test]
    fn validation_aligned_with_training() {
        let train_path = data_file("align_train.csv", "1,2,0\n4,5,1\n7,8,0\n");
        let valid_path = data_file("align_valid.csv", "2,3,1\n5,6,0\n");
        let mut config = Config::new();
        config.label_column = "2".to_string();

        let train = load(&config, &train_path).unwrap();
        let mut loader = DatasetLoader::new(&config);
        let valid = loader
            .load_from_file_aligned_with(valid_path.to_str().unwrap(), &train)
            .unwrap();

        assert_eq!(valid.num_data(), 2);
        assert_eq!(valid.num_features(), train.num_features());
        assert_eq!(valid.used_feature_map(), train.used_feature_map());
        assert_eq!(valid.feature_names(), train.feature_names());
        assert_eq!(valid.metadata().label(), &[1.0, 0.0]);
        for f in 0..valid.num_features() {
            assert_eq!(valid.feature(f).bin_mapper(), train.feature(f).bin_mapper());
        }
        // validation rows discretize through the training quantization
        let mapper = train.feature(0).bin_mapper();
        assert_eq!(valid.feature(0).bin(0), mapper.value_to_bin(2.0));
        assert_eq!(valid.feature(0).bin(1), mapper.value_to_bin(5.0));
    }

    #[test]
    fn construct_from_samples_and_push() {
        let config = Config::new();
        let mut loader = DatasetLoader::new(&config);
        let sample_values = vec![vec![1.0, 2.0, 3.0], vec![5.0, 5.0, 5.0]];
        let mut dataset = loader.construct_from_sample_data(&sample_values, 3, 5).unwrap();

        assert_eq!(dataset.num_total_features(), 2);
        assert_eq!(dataset.num_features(), 1); // second column is single-valued
        assert_eq!(dataset.used_feature_map().to_vec(), vec![Some(0), None]);
        assert_eq!(names_of(&dataset), vec!["Column_0", "Column_1"]);

        for row in 0..5 {
            dataset.push_row(0, row, &[(0, row as NumT)]);
        }
        dataset.finish_load(true).unwrap();
        let feature = dataset.feature(0);
        assert_eq!(feature.bin(0), 0);
        assert_eq!(feature.bin(1), 0); // 1.0 <= midpoint 1.5
        assert_eq!(feature.bin(2), 1);
        assert_eq!(feature.bin(3), 2);
        assert_eq!(feature.bin(4), 2);
    }

    #[test]
    fn binary_round_trip_preserves_the_dataset() {
        let path = data_file("round_trip.csv", "1,2,0\n4,5,1\n7,8,0\n");
        let mut config = Config::new();
        config.label_column = "2".to_string();

        let dataset = load(&config, &path).unwrap();
        let bin_path = format!("{}.bin", path.display());
        dataset.save_binary(&bin_path).unwrap();

        let reloaded = load(&config, &path).unwrap();
        assert!(reloaded.is_loading_from_binfile());
        assert_eq!(reloaded.num_data(), dataset.num_data());
        assert_eq!(reloaded.num_total_features(), dataset.num_total_features());
        assert_eq!(reloaded.num_features(), dataset.num_features());
        assert_eq!(reloaded.used_feature_map(), dataset.used_feature_map());
        assert_eq!(reloaded.feature_names(), dataset.feature_names());
        assert_eq!(reloaded.metadata().label(), dataset.metadata().label());
        for f in 0..dataset.num_features() {
            assert_eq!(reloaded.feature(f).bin_mapper(), dataset.feature(f).bin_mapper());
            for row in 0..dataset.num_data() {
                assert_eq!(reloaded.feature(f).bin(row), dataset.feature(f).bin(row));
            }
        }
        fs::remove_file(bin_path).unwrap();
    }

    #[test]
    fn binary_takes_precedence_over_text() {
        let path = data_file("precedence.csv", "1,2,0\n3,4,1\n5,6,0\n");
        let mut config = Config::new();
        config.label_column = "2".to_string();

        let dataset = load(&config, &path).unwrap();
        let bin_path = format!("{}.bin", path.display());
        dataset.save_binary(&bin_path).unwrap();

        // rewriting the text file changes nothing, only the binary is read
        fs::write(&path, "9,9,1\n").unwrap();
        let reloaded = load(&config, &path).unwrap();
        assert!(reloaded.is_loading_from_binfile());
        assert_eq!(reloaded.num_data(), 3);
        assert_eq!(reloaded.metadata().label(), &[0.0, 1.0, 0.0]);
        fs::remove_file(bin_path).unwrap();
    }

    #[test]
    fn binary_reload_repartitions_by_row() {
        let contents: String = (0..1000)
            .map(|i| format!("{},{}\n", i, ((i * 37) % 101) as f64 / 3.0))
            .collect();
        let path = data_file("repartition_row.csv", &contents);
        let config = Config::new(); // label is column 0, the row index

        let full = load(&config, &path).unwrap();
        assert_eq!(full.num_data(), 1000);
        let bin_path = format!("{}.bin", path.display());
        full.save_binary(&bin_path).unwrap();

        let mut filter = RowPartitionFilter::new(config.data_random_seed, 2, 4);
        let expected: Vec<usize> = (0..1000)
            .filter(|&i| filter.should_keep(i).unwrap())
            .collect();

        let part = DatasetLoader::new(&config)
            .load_from_file(path.to_str().unwrap(), 2, 4)
            .unwrap();
        assert!(part.is_loading_from_binfile());
        assert_eq!(part.num_data(), expected.len());
        for (j, &i) in expected.iter().enumerate() {
            assert_eq!(part.metadata().label()[j], i as NumT);
            assert_eq!(part.feature(0).bin(j), full.feature(0).bin(i));
        }
        fs::remove_file(bin_path).unwrap();
    }

    #[test]
    fn binary_reload_repartitions_by_group() {
        // 60 rows, 30 groups of 2; column 2 carries the group id
        let contents: String = (0..60)
            .map(|i| format!("{},{},{}\n", i, (i as f64) * 0.5 + 1.0, i / 2))
            .collect();
        let path = data_file("repartition_group.csv", &contents);
        let mut config = Config::new();
        config.group_column = "2".to_string();

        let full = load(&config, &path).unwrap();
        assert_eq!(full.metadata().query_boundaries().unwrap().len(), 31);
        let bin_path = format!("{}.bin", path.display());
        full.save_binary(&bin_path).unwrap();

        // the reload takes its groups from the binary, not from the config
        let reload_config = Config::new();
        let mut all_labels = Vec::new();
        for rank in 0..3 {
            let part = DatasetLoader::new(&reload_config)
                .load_from_file(path.to_str().unwrap(), rank, 3)
                .unwrap();
            // whole groups only: every kept group contributes both of its rows
            let labels = part.metadata().label();
            assert_eq!(labels.len() % 2, 0);
            for pair in labels.chunks(2) {
                assert_eq!(pair[1], pair[0] + 1.0);
                assert_eq!((pair[0] as usize) % 2, 0);
            }
            let boundaries = part.metadata().query_boundaries().unwrap();
            assert_eq!(*boundaries.last().unwrap(), part.num_data());
            all_labels.extend(labels.iter().map(|&l| l as usize));

            // reloading the same rank reproduces the same rows
            let again = DatasetLoader::new(&reload_config)
                .load_from_file(path.to_str().unwrap(), rank, 3)
                .unwrap();
            assert_eq!(again.metadata().label(), part.metadata().label());
        }
        all_labels.sort_unstable();
        assert_eq!(all_labels, (0..60).collect::<Vec<usize>>());
        fs::remove_file(bin_path).unwrap();
    }

    #[test]
    fn distributed_load_partitions_rows_and_agrees_on_mappers() {
        let contents: String = (0..40)
            .map(|i| format!("{},{},{}\n", i % 2, (i * 7) % 10, (i * 3) % 5))
            .collect();
        let path = data_file("dist_rows.csv", &contents);
        let path_str = path.to_str().unwrap().to_string();

        let handles: Vec<_> = InProcessNetwork::create(2).into_iter()
            .map(|network| {
                let path = path_str.clone();
                thread::spawn(move || {
                    let config = Config::new();
                    let rank = network.rank();
                    let mut loader = DatasetLoader::new(&config).with_network(&network);
                    let dataset = loader.load_from_file(&path, rank, 2).unwrap();
                    let mappers: Vec<BinMapper> = dataset.features().iter()
                        .map(|f| f.bin_mapper().clone())
                        .collect();
                    (dataset.num_data(), mappers)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0 + results[1].0, 40);
        assert!(results[0].0 > 0 && results[1].0 > 0);
        // the allgather leaves every machine with identical bin mappers
        assert_eq!(results[0].1, results[1].1);
    }

    #[test]
    fn distributed_mappers_match_single_machine() {
        let contents: String = (0..30)
            .map(|i| format!("{},{},{},{},{}\n",
                             i % 2, i, (i * 7) % 13, (i * 3) % 11, (i * 5) % 9))
            .collect();
        let path = data_file("dist_pre.csv", &contents);
        let path_str = path.to_str().unwrap().to_string();

        // pre-partitioned: both machines see the whole file, so the sample and
        // therefore the mappers must match the single-machine run exactly
        let handles: Vec<_> = InProcessNetwork::create(2).into_iter()
            .map(|network| {
                let path = path_str.clone();
                thread::spawn(move || {
                    let mut config = Config::new();
                    config.is_pre_partition = true;
                    let rank = network.rank();
                    let mut loader = DatasetLoader::new(&config).with_network(&network);
                    let dataset = loader.load_from_file(&path, rank, 2).unwrap();
                    dataset.features().iter()
                        .map(|f| f.bin_mapper().clone())
                        .collect::<Vec<BinMapper>>()
                })
            })
            .collect();
        let distributed: Vec<Vec<BinMapper>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let config = Config::new();
        let single = load(&config, &path).unwrap();
        let single_mappers: Vec<BinMapper> = single.features().iter()
            .map(|f| f.bin_mapper().clone())
            .collect();

        assert_eq!(distributed[0], single_mappers);
        assert_eq!(distributed[1], single_mappers);
    }
}
