//! Query evaluation: canonical hashing and in-memory matching.

pub mod geo;
mod hash;
mod matcher;

pub use hash::query_hash;
pub use matcher::matches_query;
