//! Persistence and HTTP fetch utilities for kiwatch.
//!
//! [`Store`] is the transactional target/observation store backed by SQLite.
//! The `(target_id, fingerprint)` uniqueness constraint lives here and is the
//! authoritative dedup guard; everything above it is an optimization.

mod error;
mod fetch;
mod schema;
mod store;

pub use error::{FetchError, StorageError};
pub use fetch::{FetchedPage, HttpClientConfig, HttpFetcher};
pub use store::{Store, StoreTx};

pub const CRATE_NAME: &str = "kiwatch-storage";

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
