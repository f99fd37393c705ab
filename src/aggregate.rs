use crate::battery::ModeResult;
use itertools::Itertools;
use std::cmp::Ordering;

/// Elementwise mean and standard deviation over the common prefix of a set
/// of per-run throughput time series.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilitySeries {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// Reduces the per-run series of one mode for the stability chart. Runs of
/// differing lengths are truncated to the minimum common length. A mode
/// with no successful runs (or an empty common prefix) contributes nothing.
pub fn stability(runs: &[Vec<f64>]) -> Option<StabilitySeries> {
    let min_len = runs.iter().map(|run| run.len()).min()?;
    if min_len == 0 {
        return None;
    }

    let n = runs.len() as f64;
    let mut mean = Vec::with_capacity(min_len);
    let mut std = Vec::with_capacity(min_len);
    for i in 0..min_len {
        let m = runs.iter().map(|run| run[i]).sum::<f64>() / n;
        let var = runs.iter().map(|run| (run[i] - m).powi(2)).sum::<f64>() / n;
        mean.push(m);
        std.push(var.sqrt());
    }

    Some(StabilitySeries { mean, std })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EfficiencyPoint {
    /// Mean over every throughput sample of every successful run.
    pub throughput_gbps: f64,
    pub cpu_percent: f64,
}

pub fn efficiency(result: &ModeResult) -> Option<EfficiencyPoint> {
    let samples = result
        .throughput_runs
        .iter()
        .flatten()
        .copied()
        .collect_vec();
    if samples.is_empty() {
        return None;
    }

    Some(EfficiencyPoint {
        throughput_gbps: mean(&samples),
        cpu_percent: result.cpu_avg?,
    })
}

/// Five-number summary for the latency boxplot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxStats {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

pub fn latency_box(samples: &[f64]) -> Option<BoxStats> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    Some(BoxStats {
        min: sorted[0],
        q1: quantile(&sorted, 0.25),
        median: quantile(&sorted, 0.5),
        q3: quantile(&sorted, 0.75),
        max: sorted[sorted.len() - 1],
    })
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

// Linear interpolation between closest ranks, over a pre-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
