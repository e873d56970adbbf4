//! Banter: a Discord group-chat bot with layered long-term memory.
//!
//! The bot consumes the Discord gateway as one sequential event stream:
//! Gateway → engagement gate → context assembly → LLM → reply or reaction,
//! with memory extraction and episode summarization running behind it on a
//! bounded background queue.
//!
//! # Architecture
//!
//! - **Transport**: Discord REST + gateway behind the [`transport::ChatTransport`] trait
//! - **Engagement**: decides when the bot speaks (mention, window, chime-in)
//! - **Context**: alternating transcript plus a memory-laden system prompt
//! - **Memory**: SQLite (+ `sqlite-vec`) store of facts, sentiment, and
//!   episodic summaries, with semantic retrieval via a local ONNX embedder
//! - **Episodes**: gap/volume segmentation feeding background summarization
//! - **Repost**: link ledger that calls out re-shared URLs

pub mod background;
pub mod chat;
pub mod config;
pub mod context;
pub mod discord;
pub mod embedding;
pub mod engagement;
pub mod episodes;
pub mod error;
pub mod llm;
pub mod memory;
pub mod reply;
pub mod repost;
pub mod transport;

pub use chat::ChatHandler;
pub use config::BotConfig;
pub use error::{BanterError, Result};
pub use transport::{ChannelMessage, ChatTransport};
