//! # RAG Harness Core
//!
//! Storage-agnostic logic for RAG Harness: the query-engine data model,
//! sentence-window chunking, the metadata filter grammar, record-store and
//! provider traits, sentence reranking, and bounded context assembly.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! stores, providers, vector indexes, and data sources live in the
//! `rag-harness` app crate and plug in through the traits defined here.

pub mod context;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod llm;
pub mod models;
pub mod rerank;
pub mod store;
pub mod text;

pub use error::{Error, Result};
