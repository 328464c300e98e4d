//! C10 — retrieval engine. Chunker + embedder + vector store + extractor orchestration.

pub mod chunker;
pub mod embedder;
pub mod extractor;
pub mod orchestrator;
pub mod vector_store;
