//! # RAG Harness
//!
//! Build, search, and query retrieval-augmented generation engines over
//! document collections.
//!
//! A query engine is built from a document URL: documents are downloaded,
//! split into sentence windows (or page images for multimodal engines),
//! embedded, and written to a vector store. Queries embed the prompt, pull
//! the nearest chunks back as references, and optionally hand them to an
//! LLM inside a context-window-bounded prompt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Data sources │──▶│  Ingestion   │──▶│ Vector store │
//! │ gs/web/shpt  │   │ chunk+embed  │   │ sqlite / ANN │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘
//!                           ▼                  │
//!                    ┌──────────────┐          │
//!                    │ Record store │◀─────────┤
//!                    │   (SQLite)   │          ▼
//!                    └──────────────┘   ┌──────────────┐
//!                                       │ Query / LLM  │
//!                                       │  (qe CLI)    │
//!                                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qe init
//! qe build movies --doc-url gs://my-docs/movies
//! qe search movies "who directed alien"
//! qe query movies "summarize the plot of alien"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`app`] | Process-scoped context holding every backend |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Record store for engines, documents, chunks, queries |
//! | [`storage`] | Object storage (local directory or GCS) |
//! | [`data_source`] | Document collections by URL scheme, and chunking |
//! | [`extract`] | Text extraction from PDF, OOXML, CSV, HTML |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Chat model providers |
//! | [`reranker`] | Cross-engine rerankers |
//! | [`vector_store`] | Vector store backends |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`orchestrator`] | Engine build, deploy, delete |
//! | [`query`] | Retrieval and generation |

pub mod app;
pub mod config;
pub mod data_source;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod managed_search;
pub mod migrate;
pub mod orchestrator;
pub mod query;
pub mod reranker;
pub mod sqlite_store;
pub mod storage;
pub mod vector_store;

pub use app::AppContext;
