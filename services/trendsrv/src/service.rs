//! Component wiring
//!
//! Builds every component once from configuration and hands out `Arc`s to
//! the two background loops.

use std::sync::Arc;

use common::{Clock, SqliteClient};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archiver::ArchivingScheduler;
use crate::config::AppConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::device::{DeviceClient, VirtualDevice};
use crate::error::{Result, TrendSrvError};
use crate::hub::BroadcastHub;
use crate::polling::PollingScheduler;
use crate::reader::Reader;
use crate::repository::Repository;
use crate::store::{ReadingStore, SqliteReadingStore};

/// Fully wired acquisition pipeline
pub struct TrendService {
    pub device: Arc<VirtualDevice>,
    pub connection: Arc<ConnectionManager>,
    pub repository: Arc<Repository>,
    pub hub: Arc<BroadcastHub>,
    pub polling: Arc<PollingScheduler>,
    pub archiver: Arc<ArchivingScheduler>,
    sqlite: Arc<SqliteClient>,
}

/// Join handles of the running loops
pub struct ServiceHandles {
    pub polling: JoinHandle<()>,
    pub archiving: JoinHandle<()>,
}

impl ServiceHandles {
    /// Wait for both loops to finish
    pub async fn join(self) {
        if let Err(e) = self.polling.await {
            warn!("Polling task ended abnormally: {}", e);
        }
        if let Err(e) = self.archiving.await {
            warn!("Archiving task ended abnormally: {}", e);
        }
    }
}

impl TrendService {
    /// Open storage, initialize the schema and wire every component
    pub async fn build(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let device = match config.device.driver.as_str() {
            "virtual" => Arc::new(VirtualDevice::new(config.device.endpoint())),
            other => {
                return Err(TrendSrvError::unsupported(format!(
                    "device driver '{}'",
                    other
                )))
            },
        };

        let sqlite = Arc::new(SqliteClient::new(&config.database.path).await?);
        let store = SqliteReadingStore::new(sqlite.clone(), clock.clone(), config.polling.batch_size);
        store.initialize().await?;
        let store: Arc<dyn ReadingStore> = Arc::new(store);

        let client: Arc<dyn DeviceClient> = device.clone();
        let connection = Arc::new(ConnectionManager::new(
            client,
            ConnectionSettings {
                connect_timeout: config.device.connect_timeout(),
                max_reconnect_attempts: config.device.max_reconnect_attempts,
            },
        ));
        let reader = Arc::new(Reader::new(
            connection.clone(),
            clock.clone(),
            config.device.read_timeout(),
        ));
        let repository = Arc::new(Repository::new(store));
        let hub = Arc::new(BroadcastHub::new());

        let polling = Arc::new(PollingScheduler::new(
            connection.clone(),
            reader,
            repository.clone(),
            hub.clone(),
            config.polling.interval(),
        ));
        let archiver = Arc::new(ArchivingScheduler::new(
            repository.clone(),
            clock,
            config.retention.clone(),
        ));

        info!(
            "Pipeline ready: device {} ({:?}), database {}",
            connection.client().endpoint(),
            config.device.cpu_type,
            sqlite.path()
        );

        Ok(Self {
            device,
            connection,
            repository,
            hub,
            polling,
            archiver,
            sqlite,
        })
    }

    /// Spawn the polling and archiving loops
    pub fn start(&self, token: &CancellationToken) -> ServiceHandles {
        ServiceHandles {
            polling: self.polling.clone().spawn(token.child_token()),
            archiving: self.archiver.clone().spawn(token.child_token()),
        }
    }

    /// Close the storage pool
    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}
