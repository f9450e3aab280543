//! Virtual device for testing
//!
//! Simulates a controller's data blocks in memory without hardware or a
//! network link. Values are stored big-endian like an S7 CPU; strings use
//! the `[max_len, actual_len, bytes...]` layout.
//!
//! Failure injection (unreachable link, per-address read faults, slow
//! reads, dropped link) lets tests drive every error path of the pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DeviceClient, DeviceError, DeviceResult};
use crate::model::{PointConfig, PointKind, DEFAULT_STRING_MAX_LENGTH};

#[derive(Debug)]
struct VirtualState {
    connected: bool,
    reachable: bool,
    /// Handshake succeeds but the link reports not-connected
    half_open: bool,
    blocks: HashMap<u16, Vec<u8>>,
    faults: HashSet<(u16, u32)>,
    read_delay: Option<Duration>,
}

/// In-memory controller image
#[derive(Debug)]
pub struct VirtualDevice {
    name: String,
    state: Mutex<VirtualState>,
    open_calls: AtomicU32,
    read_calls: AtomicU32,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(VirtualState {
                connected: false,
                reachable: true,
                half_open: false,
                blocks: HashMap::new(),
                faults: HashSet::new(),
                read_delay: None,
            }),
            open_calls: AtomicU32::new(0),
            read_calls: AtomicU32::new(0),
        }
    }

    // ==================== Failure injection ====================

    /// Make `open()` fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// `open()` returns `Ok(false)` while set
    pub fn set_half_open(&self, half_open: bool) {
        self.state.lock().half_open = half_open;
    }

    /// Every read starting at (block, offset) fails until cleared
    pub fn inject_fault(&self, block: u16, offset: u32) {
        self.state.lock().faults.insert((block, offset));
    }

    pub fn clear_fault(&self, block: u16, offset: u32) {
        self.state.lock().faults.remove(&(block, offset));
    }

    /// Delay every read by `delay`
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// Simulate the link going down underneath the client
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }

    /// Number of `open()` calls that reached the device
    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Number of read calls that reached the device
    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    // ==================== Data image ====================

    pub fn write_bytes(&self, block: u16, offset: u32, data: &[u8]) {
        let mut state = self.state.lock();
        let image = state.blocks.entry(block).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if image.len() < end {
            image.resize(end, 0);
        }
        image[start..end].copy_from_slice(data);
    }

    pub fn write_f32(&self, block: u16, offset: u32, value: f32) {
        self.write_bytes(block, offset, &value.to_be_bytes());
    }

    pub fn write_i16(&self, block: u16, offset: u32, value: i16) {
        self.write_bytes(block, offset, &value.to_be_bytes());
    }

    pub fn write_bit(&self, block: u16, offset: u32, bit: u8, value: bool) {
        let mut state = self.state.lock();
        let image = state.blocks.entry(block).or_default();
        let index = offset as usize;
        if image.len() <= index {
            image.resize(index + 1, 0);
        }
        let mask = 1u8 << (bit & 0x07);
        if value {
            image[index] |= mask;
        } else {
            image[index] &= !mask;
        }
    }

    /// Write a controller string with the given declared capacity
    ///
    /// The whole `max_length + 2` window is written so stale characters
    /// from a longer previous value do not linger.
    pub fn write_string(&self, block: u16, offset: u32, max_length: u8, value: &str) {
        let payload: Vec<u8> = value
            .chars()
            .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
            .take(max_length as usize)
            .collect();

        let mut window = vec![0u8; max_length as usize + 2];
        window[0] = max_length;
        window[1] = payload.len() as u8;
        window[2..2 + payload.len()].copy_from_slice(&payload);
        self.write_bytes(block, offset, &window);
    }

    /// Reserve a zeroed block of `size` bytes
    pub fn ensure_block(&self, block: u16, size: usize) {
        let mut state = self.state.lock();
        let image = state.blocks.entry(block).or_default();
        if image.len() < size {
            image.resize(size, 0);
        }
    }

    async fn fetch(&self, block: u16, offset: u32, length: usize) -> DeviceResult<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, result) = {
            let state = self.state.lock();
            let result = if !state.connected {
                Err(DeviceError::NotConnected)
            } else if state.faults.contains(&(block, offset)) {
                Err(DeviceError::ReadFailed {
                    address: format!("DB{}.{}", block, offset),
                    reason: "injected fault".to_string(),
                })
            } else {
                match state.blocks.get(&block) {
                    None => Err(DeviceError::OutOfRange(format!("DB{} does not exist", block))),
                    Some(image) => {
                        let start = offset as usize;
                        let end = start + length;
                        if end > image.len() {
                            Err(DeviceError::OutOfRange(format!(
                                "DB{}.{} +{} exceeds block size {}",
                                block,
                                offset,
                                length,
                                image.len()
                            )))
                        } else {
                            Ok(image[start..end].to_vec())
                        }
                    },
                }
            };
            (state.read_delay, result)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    /// Drive analog, digital and string points with synthetic values
    ///
    /// Analog points follow a sine wave scaled into their configured range
    /// (or ±100), digital points toggle every ten ticks, string points carry
    /// a tick counter.
    pub fn spawn_waveform(
        self: &Arc<Self>,
        points: Vec<PointConfig>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let device = Arc::clone(self);

        for point in &points {
            let needed = point.address.offset as usize
                + match point.kind {
                    PointKind::Analog => 4,
                    PointKind::Digital => 1,
                    PointKind::DataBlock => crate::model::DATA_BLOCK_WINDOW,
                    PointKind::String => DEFAULT_STRING_MAX_LENGTH as usize + 2,
                };
            device.ensure_block(point.address.block, needed);
        }

        tokio::spawn(async move {
            info!(
                "Virtual waveform started for {} points on {}",
                points.len(),
                device.name
            );
            let mut interval = tokio::time::interval(period);
            let mut tick: u64 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick += 1;
                        for (i, point) in points.iter().enumerate() {
                            let addr = point.address;
                            match point.kind {
                                PointKind::Analog => {
                                    let phase = ((tick + i as u64) as f32 * 0.1).sin();
                                    let value = match (point.min_value, point.max_value) {
                                        (Some(min), Some(max)) => min + (max - min) * (phase + 1.0) / 2.0,
                                        _ => phase * 100.0,
                                    };
                                    device.write_f32(addr.block, addr.offset, value);
                                },
                                PointKind::Digital => {
                                    if tick % 10 == 0 {
                                        let bit = addr.bit.unwrap_or(0);
                                        let current = device.peek_bit(addr.block, addr.offset, bit);
                                        device.write_bit(addr.block, addr.offset, bit, !current);
                                    }
                                },
                                PointKind::String => {
                                    device.write_string(
                                        addr.block,
                                        addr.offset,
                                        DEFAULT_STRING_MAX_LENGTH,
                                        &format!("tick {}", tick),
                                    );
                                },
                                PointKind::DataBlock => {},
                            }
                        }
                        debug!("Virtual waveform tick {}", tick);
                    }
                    () = token.cancelled() => {
                        info!("Virtual waveform stopped");
                        break;
                    }
                }
            }
        })
    }

    fn peek_bit(&self, block: u16, offset: u32, bit: u8) -> bool {
        let state = self.state.lock();
        state
            .blocks
            .get(&block)
            .and_then(|image| image.get(offset as usize))
            .map(|byte| (byte >> (bit & 0x07)) & 1 == 1)
            .unwrap_or(false)
    }
}

#[async_trait]
impl DeviceClient for VirtualDevice {
    fn endpoint(&self) -> String {
        format!("virtual://{}", self.name)
    }

    async fn open(&self) -> DeviceResult<bool> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(DeviceError::Unreachable(format!(
                "virtual://{} refused connection",
                self.name
            )));
        }
        state.connected = !state.half_open;
        Ok(state.connected)
    }

    async fn close(&self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_f32(&self, block: u16, offset: u32) -> DeviceResult<f32> {
        let bytes = self.fetch(block, offset, 4).await?;
        Ok(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn read_i16(&self, block: u16, offset: u32) -> DeviceResult<i16> {
        let bytes = self.fetch(block, offset, 2).await?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    async fn read_bit(&self, block: u16, offset: u32, bit: u8) -> DeviceResult<bool> {
        if bit > 7 {
            return Err(DeviceError::OutOfRange(format!(
                "bit {} at DB{}.{}",
                bit, block, offset
            )));
        }
        let bytes = self.fetch(block, offset, 1).await?;
        Ok((bytes[0] >> bit) & 1 == 1)
    }

    async fn read_bytes(&self, block: u16, offset: u32, length: usize) -> DeviceResult<Vec<u8>> {
        self.fetch(block, offset, length).await
    }
}
