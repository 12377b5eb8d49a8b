//! ragfuse - hybrid retrieval and fusion ranking
//!
//! Turns one question plus conversation history into a single, deterministically
//! ordered list of document chunks: query variants are searched through both a
//! vector and a keyword backend in parallel, merged with Reciprocal Rank Fusion,
//! and refined by a reranking pass, all under one request deadline.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod retrieval;
pub mod services;
pub mod text;

pub use error::{RagError, Result};
