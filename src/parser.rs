/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use crate::NumT;

/// Parses one text row into `(feature index, value)` pairs plus the label. The
/// parser is constructed with the label's original column index and hides that
/// column: delimited columns come out in post-label-removal coordinates, and
/// for LibSVM the leading token is the label while the `idx:value` pairs are
/// feature-indexed already.
pub enum RowParser {
    Delimited { delimiter: u8, label_idx: usize },
    LibSvm,
}

impl RowParser {
    /// Auto-detect the data format from sample lines. Fails when no known
    /// format matches.
    pub fn detect(sample_lines: &[&str], label_idx: usize) -> Result<RowParser, String> {
        let line = sample_lines.iter().map(|l| l.trim()).find(|l| !l.is_empty())
            .ok_or_else(|| "cannot determine data format: no sample rows".to_string())?;

        if is_libsvm_line(line) {
            if label_idx != 0 {
                return Err(format!("libsvm data carries its label first; \
                           label column {} cannot be honored", label_idx));
            }
            return Ok(RowParser::LibSvm);
        }
        let delimiter = if line.contains('\t') {
            b'\t'
        } else if line.contains(',') {
            b','
        } else if line.parse::<NumT>().is_ok() {
            b',' // single-column file
        } else {
            return Err(format!("unrecognized data format: '{}'", line));
        };
        Ok(RowParser::Delimited { delimiter, label_idx })
    }

    pub fn parse_one_line(&self, line: &str, pairs: &mut Vec<(usize, NumT)>, label: &mut NumT)
        -> Result<(), String>
    {
        pairs.clear();
        match *self {
            RowParser::Delimited { delimiter, label_idx } => {
                parse_delimited(line, delimiter, label_idx, pairs, label)
            },
            RowParser::LibSvm => parse_libsvm(line, pairs, label),
        }
    }
}

fn is_libsvm_line(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some(first) if first.parse::<NumT>().is_ok() => {},
        _ => return false,
    }
    let mut saw_pair = false;
    for token in tokens {
        let mut split = token.splitn(2, ':');
        let idx_ok = split.next().map(|s| s.parse::<usize>().is_ok()).unwrap_or(false);
        let val_ok = split.next().map(|s| s.parse::<NumT>().is_ok()).unwrap_or(false);
        if !idx_ok || !val_ok { return false; }
        saw_pair = true;
    }
    saw_pair
}

fn parse_delimited(line: &str, delimiter: u8, label_idx: usize,
                   pairs: &mut Vec<(usize, NumT)>, label: &mut NumT)
    -> Result<(), String>
{
    let record = split_record(line, delimiter)?;
    for (i, token) in record.iter().enumerate() {
        let token = token.trim();
        if i == label_idx {
            *label = parse_value(token)
                .ok_or_else(|| format!("cannot parse label '{}' in row '{}'", token, line))?;
            continue;
        }
        let c = if i < label_idx { i } else { i - 1 };
        if is_absent(token) { continue; }
        let v = parse_value(token)
            .ok_or_else(|| format!("cannot parse value '{}' in row '{}'", token, line))?;
        pairs.push((c, v));
    }
    Ok(())
}

fn parse_libsvm(line: &str, pairs: &mut Vec<(usize, NumT)>, label: &mut NumT)
    -> Result<(), String>
{
    let mut tokens = line.split_whitespace();
    let first = tokens.next()
        .ok_or_else(|| format!("empty libsvm row '{}'", line))?;
    *label = parse_value(first)
        .ok_or_else(|| format!("cannot parse label '{}' in row '{}'", first, line))?;
    for token in tokens {
        let colon = token.find(':')
            .ok_or_else(|| format!("malformed libsvm pair '{}' in row '{}'", token, line))?;
        let c = token[..colon].parse::<usize>()
            .map_err(|_| format!("malformed libsvm index in '{}'", token))?;
        let v = parse_value(&token[colon + 1..])
            .ok_or_else(|| format!("cannot parse value in '{}'", token))?;
        pairs.push((c, v));
    }
    Ok(())
}

/// Tokenize one delimited record, quoting-aware.
fn split_record(line: &str, delimiter: u8) -> Result<csv::StringRecord, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record),
        Ok(false) => Err(format!("empty record '{}'", line)),
        Err(err) => Err(format!("malformed record '{}': {}", line, err)),
    }
}

/// Split a header line into column names, using tab when the header contains
/// one and comma otherwise.
pub fn parse_header(line: &str) -> Result<Vec<String>, String> {
    let delimiter = if line.contains('\t') { b'\t' } else { b',' };
    let record = split_record(line, delimiter)?;
    Ok(record.iter().map(|name| name.trim().to_string()).collect())
}

/// A finite numeric token, or `None` when the cell counts as absent
/// (empty, `na`, `nan`, `null`, or a non-finite parse).
fn parse_value(token: &str) -> Option<NumT> {
    if is_absent(token) { return None; }
    token.parse::<NumT>().ok().filter(|v| v.is_finite())
}

fn is_absent(token: &str) -> bool {
    token.is_empty()
        || token.eq_ignore_ascii_case("na")
        || token.eq_ignore_ascii_case("nan")
        || token.eq_ignore_ascii_case("null")
}




// ------------------------------------------------------------------------------------------------
