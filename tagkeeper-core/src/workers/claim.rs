//! The claim/discovery primitives shared by the worker loop (§4.4) and
//! the claim sweeper (§4.5). Kept free of any process/thread concerns so
//! they can be exercised directly against an in-memory store in tests.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::Result;
use crate::store::{collections, Store, WriteOutcome};
use crate::time::now_ms;
use crate::types::{ComponentId, FileKey, LibraryFile, MetaEntry, WorkerClaim};

/// How many candidate files to pull per discovery attempt before giving up
/// and reporting "nothing claimable" for this cycle. Bounds the query
/// instead of scanning the whole `library_files` collection; operators
/// with very large fully-claimed backlogs may see one idle cycle before
/// the next unclaimed file past this window is discovered — see
/// DESIGN.md for why this is an accepted tradeoff over a single
/// anti-join query.
const DISCOVERY_BATCH: i64 = 200;

/// Finds the lexicographically smallest `library_files._key` with
/// `needs_tagging = 1 AND is_valid = 1` and no corresponding
/// `worker_claims` entry.
pub async fn discover_one(store: &Store) -> Result<Option<FileKey>> {
    let mut binds = HashMap::new();
    binds.insert("tb".to_string(), collections::LIBRARY_FILES.into());
    binds.insert("lim".to_string(), DISCOVERY_BATCH.into());
    let candidates: Vec<LibraryFile> = store
        .query(
            "SELECT * FROM type::table($tb) WHERE needs_tagging = 1 AND is_valid = 1 ORDER BY _key ASC LIMIT $lim",
            binds,
        )
        .await?;
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut claim_binds = HashMap::new();
    claim_binds.insert("tb".to_string(), collections::WORKER_CLAIMS.into());
    let claims: Vec<WorkerClaim> = store
        .query("SELECT * FROM type::table($tb)", claim_binds)
        .await?;
    let claimed: HashSet<String> = claims.into_iter().map(|c| c.file_id.0).collect();

    Ok(candidates
        .into_iter()
        .find(|f| !claimed.contains(f.key.as_str()))
        .map(|f| f.key))
}

/// Attempts the unique-key insert that is the sole claim-acquisition
/// primitive. `Ok(false)` means another worker won the race — expected,
/// logged at `debug`, never treated as an error by the caller.
pub async fn try_claim(store: &Store, file_key: &FileKey, worker_id: &ComponentId) -> Result<bool> {
    let claim = WorkerClaim::new(file_key, worker_id.clone(), now_ms());
    match store
        .insert(collections::WORKER_CLAIMS, &claim.key, &claim)
        .await?
    {
        WriteOutcome::Inserted => Ok(true),
        WriteOutcome::DuplicateKey => {
            debug!(file_key = %file_key, worker_id = %worker_id, "lost claim race");
            Ok(false)
        }
    }
}

/// Finalizes a successful completion: the `library_files` update strictly
/// precedes the claim delete, so a crash between the two leaves a
/// recoverable (sweepable) orphaned claim rather than a silently
/// re-tagged file with a stale claim.
pub async fn finalize_success(store: &Store, file_key: &FileKey, pipeline_version: &str) -> Result<()> {
    let patch = serde_json::json!({
        "needs_tagging": 0,
        "tagged": 1,
        "tagged_version": pipeline_version,
        "last_tagged_at": now_ms(),
    });
    store
        .update_merge(collections::LIBRARY_FILES, file_key.as_str(), patch)
        .await?;
    store
        .delete(collections::WORKER_CLAIMS, &file_key.claim_key())
        .await?;
    Ok(())
}

/// Releases a claim without touching the file record — used when
/// processing failed for a reason that doesn't resolve the file's state.
pub async fn release_claim(store: &Store, file_key: &FileKey) -> Result<()> {
    store.delete(collections::WORKER_CLAIMS, &file_key.claim_key()).await
}

/// Marks a file as explicitly non-taggable, per a pipeline-raised toxic
/// error (the pipeline itself asserted this file cannot be processed).
pub async fn mark_error(store: &Store, file_key: &FileKey, reason: &str) -> Result<()> {
    let patch = serde_json::json!({
        "needs_tagging": 0,
        "tagged": 0,
        "error": reason,
    });
    store.update_merge(collections::LIBRARY_FILES, file_key.as_str(), patch).await
}

/// Increments the crash counter attributed to `file_key` for `job_type`
/// and, once it reaches `threshold`, marks the file toxic instead of
/// leaving it reclaimable. Used exclusively by the claim sweeper (C5)
/// when reclaiming a claim whose worker is no longer alive — see
/// SPEC_FULL.md's resolution of the crash-attribution open question.
pub async fn record_crash_and_maybe_toxify(
    store: &Store,
    job_type: &str,
    file_key: &FileKey,
    threshold: u32,
) -> Result<bool> {
    let meta_key = format!("job_crash_count:{job_type}:{file_key}");
    let existing: Option<MetaEntry> = store.get(collections::META, &meta_key).await?;
    let count: u32 = existing
        .and_then(|e| e.value.parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
    store
        .upsert(
            collections::META,
            &meta_key,
            &MetaEntry { key: meta_key.clone(), value: count.to_string() },
        )
        .await?;
    if count >= threshold {
        mark_error(store, file_key, "toxic-file").await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::connect("claim_tests", "db").await.unwrap()
    }

    async fn seed_file(store: &Store, key: &str) {
        let file = LibraryFile {
            key: FileKey::new(key),
            needs_tagging: 1,
            tagged: 0,
            is_valid: 1,
            tagged_version: None,
            last_tagged_at: None,
            predictions: Default::default(),
            calibrated_tags: Default::default(),
            error: None,
        };
        store
            .insert(collections::LIBRARY_FILES, key, &file)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn discovers_smallest_unclaimed_key() {
        let s = store().await;
        seed_file(&s, "b").await;
        seed_file(&s, "a").await;
        seed_file(&s, "c").await;
        let found = discover_one(&s).await.unwrap().unwrap();
        assert_eq!(found.as_str(), "a");
    }

    #[tokio::test]
    async fn claimed_file_is_not_rediscovered() {
        let s = store().await;
        seed_file(&s, "a").await;
        let key = FileKey::new("a");
        assert!(try_claim(&s, &key, &ComponentId::new("w0")).await.unwrap());
        let next = discover_one(&s).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn second_claim_attempt_loses_race() {
        let s = store().await;
        seed_file(&s, "a").await;
        let key = FileKey::new("a");
        assert!(try_claim(&s, &key, &ComponentId::new("w0")).await.unwrap());
        assert!(!try_claim(&s, &key, &ComponentId::new("w1")).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_success_updates_file_then_deletes_claim() {
        let s = store().await;
        seed_file(&s, "a").await;
        let key = FileKey::new("a");
        try_claim(&s, &key, &ComponentId::new("w0")).await.unwrap();
        finalize_success(&s, &key, "v1").await.unwrap();

        let file: LibraryFile = s.get(collections::LIBRARY_FILES, "a").await.unwrap().unwrap();
        assert_eq!(file.needs_tagging, 0);
        assert_eq!(file.tagged, 1);
        assert_eq!(file.tagged_version.as_deref(), Some("v1"));
        assert!(file.last_tagged_at.is_some());

        assert!(!s.has(collections::WORKER_CLAIMS, &key.claim_key()).await.unwrap());
    }

    #[tokio::test]
    async fn toxify_after_threshold_crashes() {
        let s = store().await;
        seed_file(&s, "a").await;
        let key = FileKey::new("a");
        assert!(!record_crash_and_maybe_toxify(&s, "tag", &key, 2).await.unwrap());
        assert!(record_crash_and_maybe_toxify(&s, "tag", &key, 2).await.unwrap());
        let file: LibraryFile = s.get(collections::LIBRARY_FILES, "a").await.unwrap().unwrap();
        assert_eq!(file.needs_tagging, 0);
        assert_eq!(file.tagged, 0);
        assert_eq!(file.error.as_deref(), Some("toxic-file"));
    }
}
