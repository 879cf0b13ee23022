/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

#[macro_export]
macro_rules! safety_check {
    ($assertion:expr) => { assert!($assertion); } // enabled
    //($assertion:expr) => {} // disabled
}

pub type NumT = f64; // numeric type: parsed values, labels, weights, bin bounds
pub type BinT = u32; // discretized bin id

/// Values closer to zero than this are sparse zeros: they contribute nothing to
/// the bin statistics and are never pushed into a feature column.
pub const ZERO_EPS: NumT = 1e-15;

pub mod config;
pub mod sampler;
pub mod reader;
pub mod parser;
pub mod binner;
pub mod feature;
pub mod metadata;
pub mod dataset;
pub mod network;
pub mod loader;
