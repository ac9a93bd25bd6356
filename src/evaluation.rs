//! Character and word error rates of transcriptions against ground truth.

use std::{
    io::{self, BufRead},
    path::Path,
};

use serde::Serialize;

/// Character edit distance over the ground-truth length; 1.0 when the ground
/// truth is empty.
pub fn cer(ground_truth: &str, prediction: &str) -> f64 {
    let length = ground_truth.chars().count();
    if length == 0 {
        return 1.0;
    }
    strsim::levenshtein(ground_truth, prediction) as f64 / length as f64
}

/// Word edit distance over the number of ground-truth words; 1.0 when the
/// ground truth has no words.
pub fn wer(ground_truth: &str, prediction: &str) -> f64 {
    let expected = ground_truth.split_whitespace().collect::<Vec<_>>();
    if expected.is_empty() {
        return 1.0;
    }
    let predicted = prediction.split_whitespace().collect::<Vec<_>>();
    strsim::generic_levenshtein(&expected, &predicted) as f64 / expected.len() as f64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub ground_truth: String,
    pub prediction: String,
    pub cer: f64,
    pub wer: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub cer: f64,
    pub wer: f64,
    pub samples: Vec<Sample>,
}

pub fn evaluate<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Report {
    let samples = pairs
        .into_iter()
        .map(|(ground_truth, prediction)| Sample {
            ground_truth: ground_truth.to_string(),
            prediction: prediction.to_string(),
            cer: cer(ground_truth, prediction),
            wer: wer(ground_truth, prediction),
        })
        .collect::<Vec<_>>();
    let mean = |metric: fn(&Sample) -> f64| {
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(metric).sum::<f64>() / samples.len() as f64
        }
    };
    Report {
        cer: mean(|s| s.cer),
        wer: mean(|s| s.wer),
        samples,
    }
}

/// Reads `ground_truth<TAB>prediction` lines. A line without a tab counts
/// as an empty prediction; blank lines are skipped.
pub fn read_pairs(reader: impl BufRead) -> io::Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (ground_truth, prediction) = line.split_once('\t').unwrap_or((line.as_str(), ""));
        pairs.push((ground_truth.to_string(), prediction.to_string()));
    }
    Ok(pairs)
}

pub fn evaluate_file(path: impl AsRef<Path>) -> io::Result<Report> {
    let file = std::fs::File::open(path)?;
    let pairs = read_pairs(io::BufReader::new(file))?;
    Ok(evaluate(pairs.iter().map(|(g, p)| (g.as_str(), p.as_str()))))
}
