//! Retrieval-augmented documentation index with a persistent embedding cache.

pub mod cache;
pub mod chunker;
pub mod index;

pub use cache::{content_hash, CachedDoc, DocsCache, DocsCacheFile};
pub use chunker::{chunk_document, DocChunk};
pub use index::{DocIndex, DocIndexStatus, ScoredChunk};
