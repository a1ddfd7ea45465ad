//! Typed wrapper over a document database: collections, atomic upsert,
//! unique-key insert, and an AQL-like parameterised query channel.
//!
//! Unique-key insert is the sole claim-acquisition primitive C4 relies on:
//! SurrealDB's `CREATE` with an explicit record id fails with a
//! distinguishable error when the id already exists, and never mutates the
//! existing document on that path.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use surrealdb::engine::local::{Db, Mem};
use surrealdb::Surreal;
use tracing::{debug, warn};

use crate::error::{CoordError, Result};

use super::sanitize::sanitize_document;

/// Mirrors §4.1's failure-mode taxonomy so callers can branch without
/// string-matching driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    DuplicateKey,
}

#[derive(Debug, Clone)]
pub struct Store {
    db: Surreal<Db>,
}

impl Store {
    /// Opens an in-process, in-memory document store. Each worker
    /// subprocess opens its own handle; the main process and the worker
    /// subprocesses never share a `Surreal<Db>` instance across an OS
    /// process boundary — they share only the underlying database file
    /// via the connection parameters passed at spawn time.
    pub async fn connect(namespace: &str, database: &str) -> Result<Self> {
        let db = Surreal::new::<Mem>(())
            .await
            .map_err(|e| CoordError::transport(format!("failed to open store: {e}")))?;
        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| CoordError::transport(format!("failed to select namespace/db: {e}")))?;
        Ok(Self { db })
    }

    /// Attempts a unique-key insert. Returns `DuplicateKey` (not an error)
    /// when the key already exists — this is the expected race outcome
    /// and callers must not log it above `debug`.
    pub async fn insert<T>(&self, collection: &str, key: &str, doc: &T) -> Result<WriteOutcome>
    where
        T: Serialize + Send + Sync,
    {
        let sanitized = sanitize_document(doc)?;
        let result: std::result::Result<Option<serde_json::Map<String, Value>>, surrealdb::Error> =
            self.db
                .create((collection, key))
                .content(sanitized)
                .await;
        match result {
            Ok(_) => Ok(WriteOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => {
                debug!(collection, key, "duplicate-key insert, lost the race");
                Ok(WriteOutcome::DuplicateKey)
            }
            Err(e) => Err(CoordError::transport(format!(
                "insert into {collection}/{key} failed: {e}"
            ))),
        }
    }

    /// Atomic upsert: creates the document if absent, replaces it if present.
    pub async fn upsert<T>(&self, collection: &str, key: &str, doc: &T) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        let sanitized = sanitize_document(doc)?;
        let _: Option<serde_json::Map<String, Value>> = self
            .db
            .update((collection, key))
            .content(sanitized)
            .await
            .map_err(|e| CoordError::transport(format!("upsert {collection}/{key} failed: {e}")))?;
        Ok(())
    }

    /// Merge-patches a document in place. A no-op against a missing key is
    /// treated as success (the facade does not distinguish "patched
    /// nothing" from "patched an already-absent claim" — see C5's
    /// idempotent sweep).
    pub async fn update_merge(&self, collection: &str, key: &str, patch: Value) -> Result<()> {
        let _: Option<serde_json::Map<String, Value>> = self
            .db
            .update((collection, key))
            .merge(patch)
            .await
            .map_err(|e| CoordError::transport(format!("merge {collection}/{key} failed: {e}")))?;
        Ok(())
    }

    pub async fn get<T>(&self, collection: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.db
            .select((collection, key))
            .await
            .map_err(|e| CoordError::transport(format!("get {collection}/{key} failed: {e}")))
    }

    pub async fn has(&self, collection: &str, key: &str) -> Result<bool> {
        let found: Option<serde_json::Map<String, Value>> = self
            .db
            .select((collection, key))
            .await
            .map_err(|e| CoordError::transport(format!("has {collection}/{key} failed: {e}")))?;
        Ok(found.is_some())
    }

    /// Deletes a document by key. Idempotent: deleting an already-absent
    /// key succeeds silently, matching §8's "removing an already-removed
    /// claim is a no-op" law.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let _: Option<serde_json::Map<String, Value>> =
            self.db.delete((collection, key)).await.map_err(|e| {
                CoordError::transport(format!("delete {collection}/{key} failed: {e}"))
            })?;
        Ok(())
    }

    /// Deletes every document in `collection` matching a raw `WHERE`
    /// clause fragment, bound with `binds`. The caller supplies only the
    /// condition body (e.g. `"is_valid = 0"`); the facade wraps it in the
    /// full statement.
    pub async fn delete_match(
        &self,
        collection: &str,
        where_clause: &str,
        binds: HashMap<String, Value>,
    ) -> Result<u64> {
        let sql = format!("DELETE FROM type::table($__tb) WHERE {where_clause} RETURN BEFORE");
        let mut q = self.db.query(sql).bind(("__tb", collection.to_string()));
        for (k, v) in binds {
            q = q.bind((k, v));
        }
        let mut response = q
            .await
            .map_err(|e| CoordError::transport(format!("delete_match on {collection} failed: {e}")))?;
        let deleted: Vec<serde_json::Map<String, Value>> = response
            .take(0)
            .map_err(|e| CoordError::transport(format!("delete_match decode failed: {e}")))?;
        Ok(deleted.len() as u64)
    }

    /// The AQL-like parameterised query channel. `sql` is a full
    /// SurrealQL statement; `binds` supplies its bind variables.
    pub async fn query<T>(&self, sql: &str, binds: HashMap<String, Value>) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut q = self.db.query(sql);
        for (k, v) in binds {
            q = q.bind((k, v));
        }
        let mut response = q
            .await
            .map_err(|e| CoordError::transport(format!("query failed: {e}\n{sql}")))?;
        response
            .take(0)
            .map_err(|e| CoordError::transport(format!("query decode failed: {e}\n{sql}")))
    }

    /// Like [`Store::query`] but returns only the first row, or `None`.
    pub async fn query_one<T>(&self, sql: &str, binds: HashMap<String, Value>) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let rows: Vec<T> = self.query(sql, binds).await?;
        Ok(rows.into_iter().next())
    }
}

fn is_duplicate_key(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("already exists") || msg.contains("index") && msg.contains("unique")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    async fn store() -> Store {
        Store::connect("test_ns", "test_db").await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_duplicate_insert_is_contention_not_mutation() {
        let s = store().await;
        let w = Widget { name: "a".into(), count: 1 };
        let outcome = s.insert("widgets", "w1", &w).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Inserted);

        let w2 = Widget { name: "b".into(), count: 99 };
        let outcome2 = s.insert("widgets", "w1", &w2).await.unwrap();
        assert_eq!(outcome2, WriteOutcome::DuplicateKey);

        let fetched: Widget = s.get("widgets", "w1").await.unwrap().unwrap();
        assert_eq!(fetched, w, "duplicate-key insert must not mutate the existing document");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = store().await;
        s.delete("widgets", "missing").await.unwrap();
        s.delete("widgets", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn upsert_replaces_existing() {
        let s = store().await;
        let w1 = Widget { name: "a".into(), count: 1 };
        s.upsert("widgets", "w1", &w1).await.unwrap();
        let w2 = Widget { name: "a".into(), count: 2 };
        s.upsert("widgets", "w1", &w2).await.unwrap();
        let fetched: Widget = s.get("widgets", "w1").await.unwrap().unwrap();
        assert_eq!(fetched.count, 2);
    }
}
