/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::env;
use std::process::exit;

use cpu_time::ProcessTime;
use log::{error, info};

use boostload::config::Config;
use boostload::loader::DatasetLoader;

/// Usage: run_boostload <data file> [key=value...] [save_binary=true]
fn main() {
    pretty_env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut config = Config::new();
    let mut filename = None;
    let mut save_binary = false;
    for arg in &args {
        let result = match arg.find('=') {
            Some(split) => {
                let (key, value) = (&arg[..split], &arg[split + 1..]);
                if key == "save_binary" {
                    save_binary = value == "true" || value == "1";
                    Ok(())
                } else {
                    config.parse_str(key, value)
                }
            },
            None if filename.is_none() => {
                filename = Some(arg.clone());
                Ok(())
            },
            None => Err(format!("unexpected argument '{}'", arg)),
        };
        if let Err(msg) = result {
            error!("{}", msg);
            exit(1);
        }
    }
    let filename = match filename {
        Some(filename) => filename,
        None => {
            error!("usage: run_boostload <data file> [key=value...]");
            exit(1);
        }
    };

    let timer = ProcessTime::now();
    let mut loader = DatasetLoader::new(&config);
    let dataset = match loader.load_from_file(&filename, 0, 1) {
        Ok(dataset) => dataset,
        Err(msg) => {
            error!("failed to load {}: {}", filename, msg);
            exit(1);
        }
    };
    info!("loaded {} rows, {} of {} feature columns in {:?}",
          dataset.num_data(), dataset.num_features(), dataset.num_total_features(),
          timer.elapsed());

    if save_binary && !dataset.is_loading_from_binfile() {
        if let Err(msg) = dataset.save_binary(&format!("{}.bin", filename)) {
            error!("{}", msg);
            exit(1);
        }
    }
}
