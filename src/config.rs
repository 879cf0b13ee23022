/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

/// All knobs of the dataset loading core. Values are frozen once a loader is
/// constructed from them.
#[derive(Debug, Clone)]
pub struct Config {
    /// First non-empty line of the data file is a header line.
    pub has_header: bool,

    /// Label column: empty (defaults to column 0), an integer column index, or
    /// `name:<header name>`.
    pub label_column: String,

    /// Weight column: empty, an integer column index, or `name:<header name>`.
    pub weight_column: String,

    /// Query group column: empty, an integer column index, or `name:<header name>`.
    pub group_column: String,

    /// Comma-separated columns to drop; either all integers or a single
    /// `name:` prefix applied to the whole list.
    pub ignore_column: String,

    /// Maximum number of histogram bins per feature.
    pub max_bin: usize,

    /// Number of rows sampled to learn the bin mappers.
    pub bin_construct_sample_cnt: usize,

    /// Sample from file first, then stream the file a second time, instead of
    /// keeping the raw text in memory.
    pub use_two_round_loading: bool,

    /// The input file is already split per machine; read every row instead of
    /// sub-sampling by rank.
    pub is_pre_partition: bool,

    /// Allow sparse storage for features dominated by their default bin.
    pub is_enable_sparse: bool,

    pub num_class: usize,

    /// Seed for row sampling and machine partitioning.
    pub data_random_seed: u64,
}

impl Config {
    pub fn new() -> Config {
        Config {
            has_header: false,
            label_column: String::new(),
            weight_column: String::new(),
            group_column: String::new(),
            ignore_column: String::new(),
            max_bin: 255,
            bin_construct_sample_cnt: 200_000,
            use_two_round_loading: false,
            is_pre_partition: false,
            is_enable_sparse: true,
            num_class: 1,
            data_random_seed: 1,
        }
    }

    /// Apply a single `key=value` setting (e.g. from the command line).
    pub fn parse_str(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "has_header" => self.has_header = parse_bool(key, value)?,
            "label_column" => self.label_column = value.to_string(),
            "weight_column" => self.weight_column = value.to_string(),
            "group_column" => self.group_column = value.to_string(),
            "ignore_column" => self.ignore_column = value.to_string(),
            "max_bin" => self.max_bin = parse_num(key, value)?,
            "bin_construct_sample_cnt" => {
                self.bin_construct_sample_cnt = parse_num(key, value)?
            },
            "use_two_round_loading" => self.use_two_round_loading = parse_bool(key, value)?,
            "is_pre_partition" => self.is_pre_partition = parse_bool(key, value)?,
            "is_enable_sparse" => self.is_enable_sparse = parse_bool(key, value)?,
            "num_class" => self.num_class = parse_num(key, value)?,
            "data_random_seed" => self.data_random_seed = parse_num(key, value)?,
            _ => return Err(format!("unknown config key '{}'", key)),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("invalid boolean '{}' for config key '{}'", value, key)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value.parse::<T>()
        .map_err(|_| format!("invalid number '{}' for config key '{}'", value, key))
}




// ------------------------------------------------------------------------------------------------
