//! Repository functions: one function per cache operation.
//!
//! Every function takes a `&CachePool` and returns a `Result<T, CacheError>`.
//! No staleness logic, no domain types: pure SQL.

pub mod targets;
pub mod files;
pub mod runs;
