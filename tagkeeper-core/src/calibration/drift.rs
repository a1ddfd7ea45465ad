//! Drift metrics between two calibration snapshots (§4.7): absolute
//! percentile delta (APD), spread-range delta (SRD), and Jensen-Shannon
//! divergence (JSD) over the underlying bin distributions.

use std::collections::BTreeMap;

use crate::types::{Percentiles, SparseHistogram};

use super::histogram::bin_index;

pub fn apd(old: &Percentiles, new: &Percentiles) -> f64 {
    (new.p5 - old.p5).abs() + (new.p95 - old.p95).abs()
}

pub fn srd(old: &Percentiles, new: &Percentiles) -> f64 {
    ((new.p95 - new.p5) - (old.p95 - old.p5)).abs()
}

/// Jensen-Shannon divergence, in bits, between the two histograms'
/// implied probability distributions over the shared bin grid. Bins
/// present in only one histogram are treated as zero-probability in the
/// other, which is the standard JSD convention (it stays finite and
/// bounded even when supports differ, unlike KL divergence alone).
pub fn jsd(old: &SparseHistogram, new: &SparseHistogram, bin_width: f64) -> f64 {
    let mut merged: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    if old.n > 0 {
        for (center, count) in old.bins.iter().zip(old.counts.iter()) {
            merged.entry(bin_index(*center, bin_width)).or_insert((0.0, 0.0)).0 += *count as f64 / old.n as f64;
        }
    }
    if new.n > 0 {
        for (center, count) in new.bins.iter().zip(new.counts.iter()) {
            merged.entry(bin_index(*center, bin_width)).or_insert((0.0, 0.0)).1 += *count as f64 / new.n as f64;
        }
    }

    let mut kl_p_m = 0.0;
    let mut kl_q_m = 0.0;
    for (p, q) in merged.values() {
        let m = 0.5 * (p + q);
        if *p > 0.0 && m > 0.0 {
            kl_p_m += p * (p / m).ln();
        }
        if *q > 0.0 && m > 0.0 {
            kl_q_m += q * (q / m).ln();
        }
    }
    (0.5 * kl_p_m + 0.5 * kl_q_m) / std::f64::consts::LN_2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::histogram::build_histogram;

    #[test]
    fn identical_histograms_have_zero_drift() {
        let values: Vec<f64> = (0..50).map(|i| i as f64 / 50.0).collect();
        let h = build_histogram(&values, 0.01, 0.05, 0.95);
        assert_eq!(apd(&h.percentiles, &h.percentiles), 0.0);
        assert_eq!(srd(&h.percentiles, &h.percentiles), 0.0);
        assert!(jsd(&h, &h, 0.01).abs() < 1e-9);
    }

    #[test]
    fn disjoint_distributions_have_jsd_near_one_bit() {
        let low: Vec<f64> = vec![0.0; 100];
        let high: Vec<f64> = vec![1.0; 100];
        let h_low = build_histogram(&low, 0.01, 0.05, 0.95);
        let h_high = build_histogram(&high, 0.01, 0.05, 0.95);
        let divergence = jsd(&h_low, &h_high, 0.01);
        assert!((divergence - 1.0).abs() < 1e-6, "disjoint binary distributions should have JSD of 1 bit, got {divergence}");
    }

    #[test]
    fn shifted_percentiles_produce_positive_apd_and_srd() {
        let before = Percentiles { p5: 0.1, p95: 0.9 };
        let after = Percentiles { p5: 0.2, p95: 0.95 };
        assert!((apd(&before, &after) - 0.15).abs() < 1e-9);
        assert!((srd(&before, &after) - 0.05).abs() < 1e-9);
    }
}
