//! Multi-point read pass
//!
//! One call reads every configured point once. A failing point is replaced
//! by a `Bad` fallback so the batch stays total; only kinds without a
//! fallback (`DataBlock`) abort the pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::Clock;
use tracing::{debug, error, warn};

use crate::connection::ConnectionManager;
use crate::device::{DeviceError, DeviceResult};
use crate::error::{Result, TrendSrvError};
use crate::model::{
    PointConfig, PointKind, Quality, Reading, ReadingValue, DATA_BLOCK_WINDOW,
    DEFAULT_STRING_MAX_LENGTH,
};

/// Decode an S7 `STRING` window: `[declared_max, actual_len, bytes...]`
///
/// The actual length is clamped to `max_length` and to the payload bytes
/// present. Bytes map one-to-one onto Latin-1 code points.
pub fn decode_s7_string(bytes: &[u8], max_length: u8) -> String {
    if bytes.len() < 2 {
        return String::new();
    }
    let payload = &bytes[2..];
    let len = (bytes[1] as usize)
        .min(max_length as usize)
        .min(payload.len());
    payload[..len].iter().map(|&b| b as char).collect()
}

/// Reads point batches through the managed connection
pub struct Reader {
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
    read_timeout: Duration,
}

impl Reader {
    pub fn new(
        connection: Arc<ConnectionManager>,
        clock: Arc<dyn Clock>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            clock,
            read_timeout,
        }
    }

    /// Read every config once; one reading per config, same order
    ///
    /// All readings share one capture timestamp.
    pub async fn read_all(&self, configs: &[PointConfig]) -> Result<Vec<Reading>> {
        if !self.connection.is_connected() && !self.connection.ensure_connected().await {
            return Err(TrendSrvError::connection(format!(
                "{} is not connected",
                self.connection.client().endpoint()
            )));
        }

        let timestamp = self.clock.now();
        let mut readings = Vec::with_capacity(configs.len());

        for config in configs {
            match self.read_point(config).await {
                Ok(value) => readings.push(Reading {
                    tag_name: config.tag_name.clone(),
                    address: config.address,
                    quality: Quality::Good,
                    timestamp,
                    value,
                }),
                Err(err) => match Reading::fallback(config, timestamp) {
                    Some(fallback) => {
                        warn!("{} at {}, using fallback", err, config.address);
                        readings.push(fallback);
                    },
                    None => {
                        error!(
                            "{} at {} ({} has no fallback)",
                            err, config.address, config.kind
                        );
                        let reason = match err {
                            TrendSrvError::ReadError { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        return Err(TrendSrvError::NoFallback {
                            tag: config.tag_name.clone(),
                            kind: config.kind,
                            reason,
                        });
                    },
                },
            }
        }

        debug!("Read {} points at {}", readings.len(), timestamp);
        Ok(readings)
    }

    /// Read one point; any failure is a `ReadError` for that tag
    async fn read_point(&self, config: &PointConfig) -> Result<ReadingValue> {
        let client = self.connection.client();
        let addr = config.address;
        let tag = config.tag_name.as_str();

        let value = match config.kind {
            PointKind::Analog => {
                let value = self
                    .timed(tag, client.read_f32(addr.block, addr.offset))
                    .await?;
                ReadingValue::Analog {
                    value,
                    unit: config.unit.clone(),
                }
            },
            PointKind::Digital => {
                // Missing bit is isolated like any other per-point failure
                let bit = addr
                    .bit
                    .ok_or_else(|| TrendSrvError::read(tag, "bit index not configured"))?;
                let value = self
                    .timed(tag, client.read_bit(addr.block, addr.offset, bit))
                    .await?;
                ReadingValue::Digital { value, bit }
            },
            PointKind::DataBlock => {
                let raw = self
                    .timed(
                        tag,
                        client.read_bytes(addr.block, addr.offset, DATA_BLOCK_WINDOW),
                    )
                    .await?;
                let encoded = BASE64.encode(&raw);
                ReadingValue::DataBlock { raw, encoded }
            },
            PointKind::String => {
                let max_length = DEFAULT_STRING_MAX_LENGTH;
                let bytes = self
                    .timed(
                        tag,
                        client.read_bytes(addr.block, addr.offset, max_length as usize + 2),
                    )
                    .await?;
                ReadingValue::String {
                    value: decode_s7_string(&bytes, max_length),
                    max_length,
                }
            },
        };
        Ok(value)
    }

    async fn timed<T>(
        &self,
        tag: &str,
        read: impl Future<Output = DeviceResult<T>>,
    ) -> Result<T> {
        let result = match tokio::time::timeout(self.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.read_timeout)),
        };
        result.map_err(|e| TrendSrvError::read(tag, e.to_string()))
    }
}
