//! Sparse histogram accumulation and percentile derivation (§4.7).

use std::collections::BTreeMap;

use crate::types::{Percentiles, SparseHistogram};

/// Builds a sparse histogram over `values` (raw prediction scalars,
/// clamped into `[0, 1]`) using a fixed `bin_width`. Only non-empty bins
/// are kept, so a narrow distribution never pays for 101 empty entries.
pub fn build_histogram(values: &[f64], bin_width: f64, p_low: f64, p_high: f64) -> SparseHistogram {
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for &v in values {
        let idx = bin_index(v, bin_width);
        *counts.entry(idx).or_insert(0) += 1;
    }

    let n: u64 = values.len() as u64;
    let mut bins = Vec::with_capacity(counts.len());
    let mut bin_counts = Vec::with_capacity(counts.len());
    for (idx, count) in &counts {
        bins.push(*idx as f64 * bin_width);
        bin_counts.push(*count);
    }

    let percentiles = percentiles_from_counts(&counts, n, bin_width, p_low, p_high);
    SparseHistogram { bins, counts: bin_counts, n, percentiles }
}

pub fn bin_index(value: f64, bin_width: f64) -> i64 {
    (value.clamp(0.0, 1.0) / bin_width).round() as i64
}

fn percentiles_from_counts(counts: &BTreeMap<i64, u64>, n: u64, bin_width: f64, p_low: f64, p_high: f64) -> Percentiles {
    if n == 0 {
        return Percentiles::default();
    }
    let low_target = ((p_low * n as f64).ceil() as u64).max(1);
    let high_target = ((p_high * n as f64).ceil() as u64).max(1);

    let mut cumulative = 0u64;
    let mut p5 = 0.0;
    let mut p95 = 0.0;
    let mut low_found = false;
    for (idx, count) in counts {
        cumulative += count;
        let center = *idx as f64 * bin_width;
        if !low_found && cumulative >= low_target {
            p5 = center;
            low_found = true;
        }
        if cumulative >= high_target {
            p95 = center;
            break;
        }
    }
    if !low_found {
        p5 = p95;
    }
    Percentiles { p5, p95 }
}
