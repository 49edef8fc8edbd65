//! # Chat Search
//!
//! Semantic retrieval over chat and channel history.
//!
//! Flat message exports are rebuilt into reply threads, each thread is
//! embedded once into an append-only index generation, and queries are
//! answered by exact cosine similarity over the loaded generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌─────────────┐
//! │ messages │──▶│ threads  │──▶│  indexer   │──▶│ index store │
//! │ .json(l) │   │ rebuild  │   │ dedup+embed│   │ vec + jsonl │
//! └──────────┘   └──────────┘   └────────────┘   └──────┬──────┘
//!                                                       │ load
//!                                                       ▼
//!                                ┌──────────┐    ┌─────────────┐
//!                                │ CLI/HTTP │◀───│ similarity  │
//!                                └──────────┘    └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chat-search threads export/result.json data/threads.jsonl
//! chat-search index data/threads.jsonl
//! chat-search search "borrow checker and async closures"
//! chat-search serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`threads`] | Reply-tree reconstruction and thread stream I/O |
//! | [`indexer`] | Incremental, batch-committed embedding |
//! | [`store`] | Generation files, commit checkpoint, swap/merge/rollback |
//! | [`similarity`] | Exact cosine top-k search |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Answer synthesis |
//! | [`server`] | HTTP search API |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error kinds |

pub mod config;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod search;
pub mod server;
pub mod similarity;
pub mod stats;
pub mod store;
pub mod swap_cmd;
pub mod threads;
