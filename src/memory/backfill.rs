//! Startup embedding backfill.
//!
//! Rows written while the embedding engine was unavailable (or invalidated
//! by a merge) have no vector and are invisible to similarity search. At
//! startup the backfill sweeps each table in batches, embedding whatever is
//! missing. Per-row failures are logged and skipped; a batch that makes no
//! progress ends the sweep so persistent failures cannot spin it forever.

use tracing::{info, warn};

use crate::embedding::SharedEmbedder;
use crate::memory::store::{MemoryError, MemoryStore};

/// Rows fetched per sweep iteration.
const BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, Copy)]
enum Table {
    UserFacts,
    GroupFacts,
    Summaries,
}

impl Table {
    fn label(self) -> &'static str {
        match self {
            Self::UserFacts => "user_facts",
            Self::GroupFacts => "group_facts",
            Self::Summaries => "episodic_summaries",
        }
    }

    fn missing(
        self,
        store: &MemoryStore,
        limit: usize,
    ) -> Result<Vec<(i64, String)>, MemoryError> {
        match self {
            Self::UserFacts => store.user_facts_missing_embedding(limit),
            Self::GroupFacts => store.group_facts_missing_embedding(limit),
            Self::Summaries => store.summaries_missing_embedding(limit),
        }
    }

    fn set(self, store: &MemoryStore, id: i64, vector: &[f32]) -> Result<(), MemoryError> {
        match self {
            Self::UserFacts => store.set_user_fact_embedding(id, vector),
            Self::GroupFacts => store.set_group_fact_embedding(id, vector),
            Self::Summaries => store.set_summary_embedding(id, vector),
        }
    }
}

/// Embed every row that lacks a vector. Returns the number of rows embedded.
pub async fn backfill_missing_embeddings(store: &MemoryStore, embedder: &SharedEmbedder) -> usize {
    let mut total = 0;
    for table in [Table::UserFacts, Table::GroupFacts, Table::Summaries] {
        total += backfill_table(store, embedder, table).await;
    }
    if total > 0 {
        info!(rows = total, "embedding backfill complete");
    }
    total
}

async fn backfill_table(store: &MemoryStore, embedder: &SharedEmbedder, table: Table) -> usize {
    let mut embedded = 0usize;
    loop {
        let rows = match table.missing(store, BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = table.label(), error = %e, "missing-embedding scan failed");
                return embedded;
            }
        };
        if rows.is_empty() {
            break;
        }

        let mut progressed = 0usize;
        for (id, text) in rows {
            let vector = match embedder.embed(&text).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(table = table.label(), id, error = %e, "backfill embed failed");
                    continue;
                }
            };
            match table.set(store, id, &vector) {
                Ok(()) => progressed += 1,
                Err(e) => {
                    warn!(table = table.label(), id, error = %e, "backfill store failed");
                }
            }
        }
        embedded += progressed;
        if progressed == 0 {
            break;
        }
    }
    embedded
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::embedding::EmbeddingEngine;
    use crate::memory::store::StoreCaps;
    use crate::memory::types::Importance;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Arc<MemoryStore>) {
        let dir = TempDir::new().expect("tempdir");
        let store = MemoryStore::open(&dir.path().join("banter.db"), StoreCaps::default())
            .expect("open store");
        (dir, Arc::new(store))
    }

    #[tokio::test]
    #[ignore = "requires model download"]
    async fn backfill_fills_every_table() {
        let (_dir, store) = test_store();
        store
            .insert_user_fact("u1", "Dave", "has a corgi", Importance::Standard, None)
            .unwrap();
        store
            .insert_group_fact(
                crate::memory::types::GroupFactCategory::Joke,
                "the toaster incident",
                &[],
                Importance::Light,
                None,
            )
            .unwrap();

        let engine = EmbeddingEngine::download_and_load().expect("model");
        let embedder = SharedEmbedder::new(engine);

        let embedded = backfill_missing_embeddings(&store, &embedder).await;
        assert_eq!(embedded, 2);
        assert!(store.user_facts_missing_embedding(10).unwrap().is_empty());
        assert!(store.group_facts_missing_embedding(10).unwrap().is_empty());

        // Second sweep has nothing left to do.
        assert_eq!(backfill_missing_embeddings(&store, &embedder).await, 0);
    }
}
