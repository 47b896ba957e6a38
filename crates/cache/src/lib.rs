//! `cache` crate: pure persistence layer.
//!
//! Provides the SQLite connection pool, typed row structs, and repository
//! functions for every table in the build cache. No staleness logic lives
//! here.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::CachePool;
pub use error::CacheError;
