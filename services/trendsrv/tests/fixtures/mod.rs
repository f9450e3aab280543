//! Shared fixtures for trendsrv integration tests

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use common::FixedClock;
use tempfile::TempDir;
use trendsrv::{AppConfig, TrendService};

/// Wednesday noon UTC: never inside the Sunday maintenance window
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A service wired against an on-disk database in a temp directory
pub struct TestEnv {
    pub dir: TempDir,
    pub config: AppConfig,
    pub clock: Arc<FixedClock>,
    pub service: TrendService,
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.path().join("trendsrv.db");
    config
}

pub async fn test_env() -> Result<TestEnv> {
    let dir = tempfile::tempdir()?;
    let config = test_config(&dir);
    let clock = Arc::new(FixedClock::new(fixed_now()));
    let service = TrendService::build(&config, clock.clone()).await?;
    Ok(TestEnv {
        dir,
        config,
        clock,
        service,
    })
}

impl TestEnv {
    /// Rebuild the service on the same database, as after a restart
    pub async fn restart(self) -> Result<TestEnv> {
        self.service.close().await;
        let service = TrendService::build(&self.config, self.clock.clone()).await?;
        Ok(TestEnv {
            dir: self.dir,
            config: self.config,
            clock: self.clock,
            service,
        })
    }

    /// Put plausible values behind the three seeded points
    pub fn load_seed_values(&self) {
        let device = &self.service.device;
        device.write_f32(1, 0, 42.5);
        device.write_f32(1, 4, 3.2);
        device.write_bit(2, 0, 0, true);
    }
}
