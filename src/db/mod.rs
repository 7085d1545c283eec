//! Embedded analytical engine access: connection pool, executor, and
//! data-freshness tracking.

pub mod executor;
pub mod freshness;
pub mod pool;

pub use executor::{QueryExecutor, QueryRows};
pub use freshness::FreshnessTracker;
pub use pool::{ConnectionPool, PoolHealth, PooledConnection};
