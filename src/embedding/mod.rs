//! Local model backends
//!
//! - FastEmbedProvider: on-device text embeddings (all-MiniLM-L6-v2, 384-dim by default)
//! - FastEmbedReranker: on-device cross-encoder scoring
//!
//! Both implement the service traits from `crate::services`, so they are
//! interchangeable with the remote HTTP clients.
mod provider;
mod rerank;

pub use provider::FastEmbedProvider;
pub use rerank::FastEmbedReranker;
