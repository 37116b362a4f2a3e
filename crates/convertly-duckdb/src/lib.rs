pub mod backend;
pub mod queries;
pub mod schema;
pub mod session;
pub mod store_impl;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so tests can reach `convertly_duckdb::duckdb::params!`
/// without an extra dependency.
pub use duckdb;
