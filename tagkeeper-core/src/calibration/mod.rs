//! Calibration Engine (C7): builds per-label histograms from raw model
//! predictions, derives p5/p95 percentiles, tracks drift against history,
//! and applies the calibration to produce the tags `library_files`
//! actually surfaces.

pub mod drift;
pub mod histogram;

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::error::{CoordError, Result};
use crate::store::{collections, Store};
use crate::time::now_ms;
use crate::types::{CalibratedTag, CalibrationHistoryEntry, CalibrationKey, CalibrationState, LibraryFile};
use tagkeeper_config::CalibrationConfig;

/// Three tiers, split at even thirds. The spec leaves the exact
/// thresholding table to the domain; this is the fixed convention this
/// engine applies uniformly to every label.
fn tier_for(calibrated_value: f64) -> &'static str {
    if calibrated_value < 1.0 / 3.0 {
        "low"
    } else if calibrated_value < 2.0 / 3.0 {
        "mid"
    } else {
        "high"
    }
}

fn clip_and_normalize(raw: f64, p5: f64, p95: f64) -> f64 {
    if (p95 - p5).abs() < f64::EPSILON {
        return raw.clamp(0.0, 1.0);
    }
    let (lo, hi) = if p5 <= p95 { (p5, p95) } else { (p95, p5) };
    let clipped = raw.clamp(lo, hi);
    ((clipped - p5) / (p95 - p5)).clamp(0.0, 1.0)
}

/// Every `(model, head, label)` triple currently present in any file's
/// predictions, and every raw sample observed for it.
async fn collect_samples(store: &Store) -> Result<HashMap<CalibrationKey, Vec<f64>>> {
    let mut binds = HashMap::new();
    binds.insert("tb".to_string(), collections::LIBRARY_FILES.into());
    let files: Vec<LibraryFile> = store.query("SELECT * FROM type::table($tb)", binds).await?;

    let mut samples: HashMap<CalibrationKey, Vec<f64>> = HashMap::new();
    for file in &files {
        for (model, heads) in &file.predictions {
            for (head, labels) in heads {
                for (label, value) in labels {
                    let key = CalibrationKey::new(model.clone(), head.clone(), label.clone());
                    samples.entry(key).or_default().push(*value);
                }
            }
        }
    }
    Ok(samples)
}

/// Rebuilds `calibration_state` for every `(model, head, label)` triple
/// observed in the current `library_files` predictions. One document per
/// distinct label, not per head — a binary head with labels A and B
/// produces two independent histograms.
pub async fn generate_calibration(store: &Store, config: &CalibrationConfig) -> Result<Vec<CalibrationKey>> {
    let samples = collect_samples(store).await?;
    let mut keys = Vec::with_capacity(samples.len());
    for (key, values) in &samples {
        let built = histogram::build_histogram(values, config.calibration_bin_width, config.percentile_low, config.percentile_high);
        let state = CalibrationState { key: key.clone(), histogram: built, updated_at_ms: now_ms() };
        store.upsert(collections::CALIBRATION_STATE, &key.storage_key(), &state).await?;
        keys.push(key.clone());
    }
    info!(labels = keys.len(), "calibration generated");
    Ok(keys)
}

/// Appends a drift snapshot for `key` against the most recent prior
/// `calibration_history` entry for the same key. The first recording for
/// a key has no predecessor and is stored with zero drift.
pub async fn record_history(store: &Store, key: &CalibrationKey, config: &CalibrationConfig) -> Result<CalibrationHistoryEntry> {
    let state: Option<CalibrationState> = store.get(collections::CALIBRATION_STATE, &key.storage_key()).await?;
    let Some(state) = state else {
        return Err(CoordError::semantic(format!("no calibration_state for {key}")));
    };

    let mut binds = HashMap::new();
    binds.insert("tb".to_string(), collections::CALIBRATION_HISTORY.into());
    binds.insert("model".to_string(), key.model.clone().into());
    binds.insert("head".to_string(), key.head.clone().into());
    binds.insert("label".to_string(), key.label.clone().into());
    let previous: Option<CalibrationHistoryEntry> = store
        .query_one(
            "SELECT * FROM type::table($tb) WHERE key.model = $model AND key.head = $head AND key.label = $label ORDER BY recorded_at_ms DESC LIMIT 1",
            binds,
        )
        .await?;

    let (apd, srd, jsd) = match &previous {
        Some(prev) => (
            drift::apd(&prev.histogram.percentiles, &state.histogram.percentiles),
            drift::srd(&prev.histogram.percentiles, &state.histogram.percentiles),
            drift::jsd(&prev.histogram, &state.histogram, config.calibration_bin_width),
        ),
        None => (0.0, 0.0, 0.0),
    };

    let entry = CalibrationHistoryEntry {
        key: key.clone(),
        histogram: state.histogram,
        apd,
        srd,
        jsd,
        recorded_at_ms: now_ms(),
    };
    let record_id = uuid::Uuid::new_v4().to_string();
    store.insert(collections::CALIBRATION_HISTORY, &record_id, &entry).await?;
    Ok(entry)
}

/// Applies `key`'s calibration to every file carrying a raw prediction
/// for it. A missing calibration state is not an error — the raw
/// prediction is simply left untouched, per §4.7 invariant 1.
pub async fn write_calibrated_tags(store: &Store, key: &CalibrationKey) -> Result<u64> {
    let state: Option<CalibrationState> = store.get(collections::CALIBRATION_STATE, &key.storage_key()).await?;
    let Some(state) = state else {
        return Ok(0);
    };
    let p5 = state.histogram.percentiles.p5;
    let p95 = state.histogram.percentiles.p95;

    let mut binds = HashMap::new();
    binds.insert("tb".to_string(), collections::LIBRARY_FILES.into());
    let files: Vec<LibraryFile> = store.query("SELECT * FROM type::table($tb)", binds).await?;

    let mut written = 0u64;
    for mut file in files {
        let Some(raw) = file
            .predictions
            .get(&key.model)
            .and_then(|heads| heads.get(&key.head))
            .and_then(|labels| labels.get(&key.label))
            .copied()
        else {
            continue;
        };

        let calibrated_value = clip_and_normalize(raw, p5, p95);
        let tag = CalibratedTag { calibrated_value, tier: tier_for(calibrated_value).to_string() };
        file.calibrated_tags.insert(key.label.clone(), tag);
        store
            .update_merge(
                collections::LIBRARY_FILES,
                file.key.as_str(),
                serde_json::json!({ "calibrated_tags": file.calibrated_tags }),
            )
            .await?;
        written += 1;
    }
    Ok(written)
}

/// The distinct `(model, head)` pairs present in `keys`, used to confirm
/// §4.7 invariant 2 (doc count == distinct labels, not distinct heads).
pub fn distinct_heads(keys: &[CalibrationKey]) -> HashSet<(String, String)> {
    keys.iter().map(|k| (k.model.clone(), k.head.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config() -> CalibrationConfig {
        CalibrationConfig { calibration_bin_width: 0.01, percentile_low: 0.05, percentile_high: 0.95 }
    }

    async fn store() -> Arc<Store> {
        Arc::new(Store::connect("calibration_tests", "db").await.unwrap())
    }

    async fn seed_file_with_predictions(store: &Store, key: &str, model: &str, head: &str, labels: &[(&str, f64)]) {
        let mut label_map = HashMap::new();
        for (label, value) in labels {
            label_map.insert(label.to_string(), *value);
        }
        let mut head_map = HashMap::new();
        head_map.insert(head.to_string(), label_map);
        let mut predictions = HashMap::new();
        predictions.insert(model.to_string(), head_map);

        let file = LibraryFile {
            key: crate::types::FileKey::new(key),
            needs_tagging: 0,
            tagged: 1,
            is_valid: 1,
            tagged_version: Some("v1".into()),
            last_tagged_at: Some(now_ms()),
            predictions,
            calibrated_tags: HashMap::new(),
            error: None,
        };
        store.upsert(collections::LIBRARY_FILES, key, &file).await.unwrap();
    }

    #[tokio::test]
    async fn one_document_per_label_not_per_head() {
        let s = store().await;
        seed_file_with_predictions(&s, "a", "genre_model", "binary_head", &[("rock", 0.8), ("pop", 0.2)]).await;
        seed_file_with_predictions(&s, "b", "genre_model", "binary_head", &[("rock", 0.3), ("pop", 0.7)]).await;

        let keys = generate_calibration(&s, &config()).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(distinct_heads(&keys).len(), 1);
    }

    #[tokio::test]
    async fn write_calibrated_tags_is_a_noop_without_calibration_state() {
        let s = store().await;
        seed_file_with_predictions(&s, "a", "genre_model", "binary_head", &[("rock", 0.8)]).await;
        let key = CalibrationKey::new("genre_model", "binary_head", "rock");
        let written = write_calibrated_tags(&s, &key).await.unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn write_calibrated_tags_clips_and_normalizes() {
        let s = store().await;
        for i in 0..20 {
            seed_file_with_predictions(&s, &format!("f{i}"), "m", "h", &[("rock", i as f64 / 20.0)]).await;
        }
        generate_calibration(&s, &config()).await.unwrap();
        let key = CalibrationKey::new("m", "h", "rock");
        let written = write_calibrated_tags(&s, &key).await.unwrap();
        assert_eq!(written, 20);

        let file: LibraryFile = s.get(collections::LIBRARY_FILES, "f0").await.unwrap().unwrap();
        let tag = file.calibrated_tags.get("rock").unwrap();
        assert!(tag.calibrated_value >= 0.0 && tag.calibrated_value <= 1.0);
        assert!(file.predictions["m"]["h"]["rock"] >= 0.0, "raw predictions must be preserved");
    }

    #[tokio::test]
    async fn first_history_entry_has_zero_drift() {
        let s = store().await;
        seed_file_with_predictions(&s, "a", "m", "h", &[("rock", 0.5)]).await;
        generate_calibration(&s, &config()).await.unwrap();
        let key = CalibrationKey::new("m", "h", "rock");
        let entry = record_history(&s, &key, &config()).await.unwrap();
        assert_eq!(entry.apd, 0.0);
        assert_eq!(entry.srd, 0.0);
        assert_eq!(entry.jsd, 0.0);
    }
}
