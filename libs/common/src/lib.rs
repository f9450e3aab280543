//! `trendsrv` basic library
//!
//! Provides plumbing shared by the service binary and its tests:
//! - logging bootstrap
//! - graceful shutdown signal handling
//! - SQLite client with edge-friendly pragmas
//! - clock abstraction for deterministic time in tests

pub mod logging;
pub mod shutdown;
pub mod sqlite;
pub mod time;

pub use logging::{init_with_config, LogConfig, LogGuard};
pub use shutdown::{shutdown_token, wait_for_shutdown};
pub use sqlite::{SqliteClient, SqlitePool};
pub use time::{Clock, FixedClock, SystemClock};

// Re-export common dependencies
pub use anyhow;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
