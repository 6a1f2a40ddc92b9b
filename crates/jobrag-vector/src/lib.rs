//! Dense-embedding side of retrieval: an in-memory cosine similarity store
//! partitioned by job.
pub mod store;

pub use store::VectorStore;
