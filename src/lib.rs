//! # note-rags
//!
//! A retrieval-augmented question answering service over local notes.
//!
//! note-rags ingests plain-text note files into a SQLite-backed vector
//! store (chunking and embedding them), and answers natural-language
//! questions by retrieving the most relevant chunks, assembling them into
//! a token-budgeted prompt context, and streaming a generated answer as a
//! typed event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ File events │──▶│  Ingestion    │──▶│  SQLite   │
//! │ (HTTP/CLI)  │   │ Chunk+Embed  │   │ Vectors  │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//! ┌─────────────┐   ┌──────────────┐        │
//! │   Queries   │──▶│  Retrieval    │◀───────┘
//! │ (HTTP/CLI)  │   │ Context+Gen  │──▶ NDJSON event stream
//! └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nrag init                           # create database
//! nrag ingest ./notes/meeting.md      # index one file
//! nrag ask "what did we decide?"      # streamed answer
//! nrag serve                          # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and stream events |
//! | [`error`] | Pipeline error taxonomy |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | SQLite vector store and similarity search |
//! | [`ingest`] | Ingestion coordinator (file events → chunks) |
//! | [`retrieve`] | Top-k retrieval |
//! | [`context`] | Context assembly (dedup + token budget) |
//! | [`generate`] | Streaming answer generation |
//! | [`stream`] | Typed event stream encoding |
//! | [`query`] | Query pipeline orchestration |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod stream;
