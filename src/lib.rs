//! # Patrika Assist
//!
//! A retrieval-augmented chatbot backend for Rajasthan Patrika: it
//! classifies each query's intent, retrieves grounding passages from a
//! vector index, and streams a generated answer together with a follow-up
//! support menu.
//!
//! ## Architecture
//!
//! ```text
//!  ingestion:  document ──▶ chunk ──▶ embed ──▶ vector index
//!
//!  query:      query ──▶ router ──┬──▶ retriever ──▶ assembler ──▶ dispatcher ──▶ client
//!                                 └────────────────▶ assembler ──┘   (long-poll / SSE / WS)
//! ```
//!
//! Pure logic (chunking, intents, routing table, envelopes, the in-memory
//! index) lives in the `patrika-assist-core` crate. This crate adds the
//! network clients, the orchestration, and the HTTP and CLI surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding gateways (Gemini, Ollama, local) |
//! | [`generation`] | Text generation (Gemini, streaming) |
//! | [`pinecone`] | Pinecone vector index client |
//! | [`retriever`] | Query-time retrieval |
//! | [`router`] | Intent classification and turn planning |
//! | [`agents`] | Prompt assembly per response strategy |
//! | [`dispatcher`] | The chat engine and per-turn streaming |
//! | [`ingest`] | Document and JSONL ingestion |
//! | [`server`] | HTTP server (long-poll, SSE, WebSocket) |
//! | [`services`] | Composition root |

pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod pinecone;
pub mod progress;
pub mod retriever;
pub mod router;
pub mod server;
pub mod services;
