//! jobrag-text
//!
//! Keyword side of retrieval: the shared analyzer, the BM25 index and the
//! query preprocessor.
pub mod analyzer;
pub mod index;
pub mod preprocess;

pub use analyzer::Analyzer;
pub use index::{Bm25Params, KeywordIndex, KeywordStats};
pub use preprocess::{PreprocessedQuery, QueryIntent, QueryPreprocessor};
