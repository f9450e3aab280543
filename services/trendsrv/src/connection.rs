//! Connection lifecycle for the single device link
//!
//! Backoff is cooperative: inside the window `ensure_connected` fails
//! immediately instead of sleeping, so the polling loop keeps its own
//! cadence and stays responsive to cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::DeviceClient;

/// Upper bound of the reconnect backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Connection policy
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on a single `open()` call
    pub connect_timeout: Duration,
    /// Attempt count that triggers the ceiling log; attempts never stop
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug)]
struct ConnectionContext {
    state: ConnectionState,
    attempts: u32,
    last_attempt: Option<Instant>,
}

/// Owns the device link, attempt counter and backoff timing
pub struct ConnectionManager {
    client: Arc<dyn DeviceClient>,
    settings: ConnectionSettings,
    context: Mutex<ConnectionContext>,
}

impl ConnectionManager {
    pub fn new(client: Arc<dyn DeviceClient>, settings: ConnectionSettings) -> Self {
        Self {
            client,
            settings,
            context: Mutex::new(ConnectionContext {
                state: ConnectionState::Disconnected,
                attempts: 0,
                last_attempt: None,
            }),
        }
    }

    /// Shared handle to the device for reads
    pub fn client(&self) -> &Arc<dyn DeviceClient> {
        &self.client
    }

    /// Delay required after `attempts` consecutive failures
    ///
    /// `min(60, 2^attempts)` seconds.
    pub fn backoff_delay(attempts: u32) -> Duration {
        let secs = 1u64
            .checked_shl(attempts)
            .unwrap_or(u64::MAX)
            .min(MAX_BACKOFF.as_secs());
        Duration::from_secs(secs)
    }

    /// Make sure the link is open, attempting one connect if allowed
    ///
    /// Returns `false` without contacting the device while inside the
    /// backoff window.
    pub async fn ensure_connected(&self) -> bool {
        let mut ctx = self.context.lock().await;

        if ctx.state == ConnectionState::Connected {
            if self.client.is_connected() {
                return true;
            }
            warn!("Link to {} lost", self.client.endpoint());
            ctx.state = ConnectionState::Disconnected;
        }

        if ctx.attempts > 0 {
            if let Some(last) = ctx.last_attempt {
                let wait = Self::backoff_delay(ctx.attempts);
                let elapsed = last.elapsed();
                if elapsed < wait {
                    debug!(
                        "Reconnect backoff: {:?} remaining after {} attempts",
                        wait - elapsed,
                        ctx.attempts
                    );
                    return false;
                }
            }
        }

        ctx.last_attempt = Some(Instant::now());
        let endpoint = self.client.endpoint();
        debug!("Connecting to {} (attempt {})", endpoint, ctx.attempts + 1);

        let failure = match tokio::time::timeout(self.settings.connect_timeout, self.client.open())
            .await
        {
            Ok(Ok(true)) => {
                ctx.state = ConnectionState::Connected;
                ctx.attempts = 0;
                info!("Connected to {}", endpoint);
                return true;
            },
            Ok(Ok(false)) => "handshake completed but client reports not connected".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                self.client.close().await;
                format!("timed out after {:?}", self.settings.connect_timeout)
            },
        };

        ctx.attempts = ctx.attempts.saturating_add(1);
        warn!(
            "Connect to {} failed (attempt {}): {}",
            endpoint, ctx.attempts, failure
        );
        if ctx.attempts >= self.settings.max_reconnect_attempts {
            error!(
                "Max reconnect attempts ({}) reached for {}; retrying every {:?}",
                self.settings.max_reconnect_attempts,
                endpoint,
                Self::backoff_delay(ctx.attempts)
            );
        }
        false
    }

    /// Close the link if open; idempotent
    pub async fn disconnect(&self) {
        let mut ctx = self.context.lock().await;
        if self.client.is_connected() {
            self.client.close().await;
            info!("Disconnected from {}", self.client.endpoint());
        }
        ctx.state = ConnectionState::Disconnected;
    }

    pub async fn state(&self) -> ConnectionState {
        self.context.lock().await.state
    }

    /// Consecutive failed attempts since the last success
    pub async fn attempts(&self) -> u32 {
        self.context.lock().await.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}
