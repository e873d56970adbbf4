//! Layered durable memory.
//!
//! Sub-modules:
//! - `types`: shared record types, enums, and time/token helpers.
//! - `schema`: SQLite DDL (regular tables and `sqlite-vec` virtual tables).
//! - `store`: the SQLite-backed [`MemoryStore`].
//! - `retrieval`: token-budgeted tiered retrieval for the system prompt.
//! - `extraction`: post-reply fact/sentiment extraction and merge.
//! - `backfill`: startup sweep that embeds rows missing vectors.

pub mod backfill;
pub mod extraction;
pub mod retrieval;
pub(crate) mod schema;
pub mod store;
pub mod types;

// Re-export what the rest of the codebase imports from `crate::memory::*`.

pub use backfill::backfill_missing_embeddings;
pub use extraction::Extractor;
pub use retrieval::Retriever;
pub use store::{MemoryError, MemoryStore, NewLink, NewSummary, StoreCaps};
pub use types::{
    EpisodicSummary, GroupFact, GroupFactCategory, Importance, LinkRecord, SentimentScore,
    UserFact, estimate_tokens, now_epoch_secs,
};
