//! trendsrv - controller data acquisition service
//!
//! Polls one industrial controller, stores readings in SQLite, keeps the
//! latest value per tag in memory, retires old data and fans new batches
//! out to live subscribers.
//!
//! Data flow:
//!
//! ```text
//! PollingScheduler -> ConnectionManager -> Reader -> Repository -> BroadcastHub
//! ArchivingScheduler -> Repository::delete_older_than
//! ```

pub mod archiver;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod hub;
pub mod model;
pub mod polling;
pub mod reader;
pub mod repository;
pub mod service;
pub mod store;

pub use archiver::{is_maintenance_window, ArchiveOutcome, ArchivingScheduler};
pub use config::AppConfig;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use device::{DeviceClient, DeviceError, VirtualDevice};
pub use error::{Result, TrendSrvError};
pub use hub::{BroadcastHub, ChannelSubscriber, Subscriber, SubscriptionId};
pub use model::{Address, LiveValue, PointConfig, PointKind, Quality, Reading, ReadingValue};
pub use polling::{CycleOutcome, PollingScheduler};
pub use reader::Reader;
pub use repository::{Repository, RetentionReport};
pub use service::{ServiceHandles, TrendService};
pub use store::{ReadingStore, SqliteReadingStore};
