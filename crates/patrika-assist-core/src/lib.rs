//! # Patrika Assist Core
//!
//! Shared, I/O-free logic for Patrika Assist: data models, chunking, the
//! intent enumeration and routing table, the streaming envelope state
//! machine, and the vector index and embedding traits.
//!
//! This crate contains no HTTP clients, no tokio runtime, and no server
//! code. Capability clients (Gemini, Pinecone, Ollama) and transports live
//! in the `patrika-assist` app crate.

pub mod chunk;
pub mod embedding;
pub mod envelope;
pub mod intent;
pub mod models;
pub mod routing;
pub mod store;
