//! Persistence and outbound HTTP plumbing for recon.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod rate_limit;
pub mod store;

pub use http::{Auth, FetchError, HttpClientConfig, HttpFetcher, JsonRequest, JsonTransport, RetryPolicy};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rate_limit::{RateLimiter, RateLimiters};
pub use store::{MergeApplied, Store, StoreError, StoreResult, UpsertOutcome};

pub const CRATE_NAME: &str = "recon-storage";
