//! Retrieval Indices
//!
//! Three derived projections keyed by resource id, each rebuildable from the
//! resource store at any time:
//! - lexical: FTS5 BM25 over title/description/body,
//! - dense: unit-norm vectors with exact cosine scan (HNSW optional),
//! - sparse: learned term-weight maps with dot-product scoring.
//!
//! Writes are routed through the task queue (single writer per resource);
//! reads are lock-cheap and safe from the search fan-out threads.

mod dense;
mod lexical;
mod sparse;

pub use dense::DenseIndex;
pub use lexical::{sanitize_fts5_query, LexicalDocument, LexicalIndex};
pub use sparse::{SparseIndex, SparseSearchOutcome};
