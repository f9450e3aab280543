//! Point configuration and reading types
//!
//! `PointKind` is a closed set. Everything that varies per kind dispatches
//! through an exhaustive `match`, so a new kind is a compile error until
//! every reader, store and projection handles it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default declared capacity of a controller string (S7 `STRING`)
pub const DEFAULT_STRING_MAX_LENGTH: u8 = 254;

/// Fixed window read for a `DataBlock` point
pub const DATA_BLOCK_WINDOW: usize = 256;

/// Default per-point polling interval carried in configuration
pub const DEFAULT_POINT_POLLING_INTERVAL_MS: u32 = 5000;

/// Kind of a monitored point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointKind {
    Analog,
    Digital,
    DataBlock,
    String,
}

impl PointKind {
    pub const ALL: [PointKind; 4] = [
        PointKind::Analog,
        PointKind::Digital,
        PointKind::DataBlock,
        PointKind::String,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PointKind::Analog => "Analog",
            PointKind::Digital => "Digital",
            PointKind::DataBlock => "DataBlock",
            PointKind::String => "String",
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Analog" => Ok(PointKind::Analog),
            "Digital" => Ok(PointKind::Digital),
            "DataBlock" => Ok(PointKind::DataBlock),
            "String" => Ok(PointKind::String),
            other => Err(format!("unknown point kind '{}'", other)),
        }
    }
}

/// Location of a value in the controller's data blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Data block number
    pub block: u16,
    /// Byte offset inside the block
    pub offset: u32,
    /// Bit index (0-7), digital points only
    pub bit: Option<u8>,
}

impl Address {
    pub fn new(block: u16, offset: u32) -> Self {
        Self {
            block,
            offset,
            bit: None,
        }
    }

    pub fn with_bit(block: u16, offset: u32, bit: u8) -> Self {
        Self {
            block,
            offset,
            bit: Some(bit),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "DB{}.{}.{}", self.block, self.offset, bit),
            None => write!(f, "DB{}.{}", self.block, self.offset),
        }
    }
}

/// Configuration of one monitored point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    /// Unique key
    pub tag_name: String,
    pub display_name: String,
    pub kind: PointKind,
    pub address: Address,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub min_value: Option<f32>,
    #[serde(default)]
    pub max_value: Option<f32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_polling_interval_ms() -> u32 {
    DEFAULT_POINT_POLLING_INTERVAL_MS
}

impl PointConfig {
    fn new(tag_name: impl Into<String>, kind: PointKind, address: Address) -> Self {
        let tag_name = tag_name.into();
        Self {
            display_name: tag_name.clone(),
            tag_name,
            kind,
            address,
            unit: None,
            min_value: None,
            max_value: None,
            enabled: true,
            polling_interval_ms: DEFAULT_POINT_POLLING_INTERVAL_MS,
        }
    }

    pub fn analog(tag_name: impl Into<String>, block: u16, offset: u32) -> Self {
        Self::new(tag_name, PointKind::Analog, Address::new(block, offset))
    }

    pub fn digital(tag_name: impl Into<String>, block: u16, offset: u32, bit: u8) -> Self {
        Self::new(
            tag_name,
            PointKind::Digital,
            Address::with_bit(block, offset, bit),
        )
    }

    pub fn data_block(tag_name: impl Into<String>, block: u16, offset: u32) -> Self {
        Self::new(tag_name, PointKind::DataBlock, Address::new(block, offset))
    }

    pub fn string(tag_name: impl Into<String>, block: u16, offset: u32) -> Self {
        Self::new(tag_name, PointKind::String, Address::new(block, offset))
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Points seeded into an empty configuration table
pub fn default_points() -> Vec<PointConfig> {
    vec![
        PointConfig::analog("Temperature_Reactor1", 1, 0)
            .with_display_name("Reactor 1 Temperature")
            .with_unit("°C")
            .with_range(0.0, 200.0),
        PointConfig::analog("Pressure_Line1", 1, 4)
            .with_display_name("Line 1 Pressure")
            .with_unit("bar")
            .with_range(0.0, 10.0),
        PointConfig::digital("Pump_Running", 2, 0, 0).with_display_name("Main Pump Status"),
    ]
}

/// Trustworthiness of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    /// OPC-style numeric code (192 good, 0 bad)
    pub fn code(&self) -> i64 {
        match self {
            Quality::Good => 192,
            Quality::Bad => 0,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 192 {
            Quality::Good
        } else {
            Quality::Bad
        }
    }
}

/// Kind-specific payload of a reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ReadingValue {
    Analog {
        value: f32,
        unit: Option<String>,
    },
    Digital {
        value: bool,
        bit: u8,
    },
    DataBlock {
        raw: Vec<u8>,
        /// Base64 text form used for storage and transport
        encoded: String,
    },
    String {
        value: String,
        max_length: u8,
    },
}

/// One acquired value, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tag_name: String,
    pub address: Address,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub value: ReadingValue,
}

impl Reading {
    pub fn kind(&self) -> PointKind {
        match self.value {
            ReadingValue::Analog { .. } => PointKind::Analog,
            ReadingValue::Digital { .. } => PointKind::Digital,
            ReadingValue::DataBlock { .. } => PointKind::DataBlock,
            ReadingValue::String { .. } => PointKind::String,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }

    /// `Bad`-quality placeholder for a point whose read failed
    ///
    /// Returns `None` for `DataBlock`: a zeroed window would be
    /// indistinguishable from real content, so that kind has no fallback.
    pub fn fallback(config: &PointConfig, timestamp: DateTime<Utc>) -> Option<Reading> {
        let value = match config.kind {
            PointKind::Analog => ReadingValue::Analog {
                value: 0.0,
                unit: config.unit.clone(),
            },
            PointKind::Digital => ReadingValue::Digital {
                value: false,
                bit: config.address.bit.unwrap_or(0),
            },
            PointKind::String => ReadingValue::String {
                value: String::new(),
                max_length: DEFAULT_STRING_MAX_LENGTH,
            },
            PointKind::DataBlock => return None,
        };

        Some(Reading {
            tag_name: config.tag_name.clone(),
            address: config.address,
            quality: Quality::Bad,
            timestamp,
            value,
        })
    }

    /// Projection for the presentation layer
    pub fn to_live_value(&self) -> LiveValue {
        let (value, unit) = match &self.value {
            ReadingValue::Analog { value, unit } => (serde_json::json!(value), unit.clone()),
            ReadingValue::Digital { value, .. } => (serde_json::json!(value), None),
            ReadingValue::DataBlock { encoded, .. } => (serde_json::json!(encoded), None),
            ReadingValue::String { value, .. } => (serde_json::json!(value), None),
        };

        LiveValue {
            tag_name: self.tag_name.clone(),
            value,
            unit,
            quality: self.quality.code(),
            timestamp: self.timestamp,
            kind: self.kind(),
        }
    }
}

/// Flat, serializable view of a reading for live displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveValue {
    pub tag_name: String,
    pub value: serde_json::Value,
    pub unit: Option<String>,
    pub quality: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: PointKind,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_768_329_366_000).unwrap()
    }

    #[test]
    fn test_point_kind_parse_roundtrip() {
        for kind in PointKind::ALL {
            assert_eq!(kind.as_str().parse::<PointKind>().unwrap(), kind);
        }
        assert!("Float".parse::<PointKind>().is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new(1, 4).to_string(), "DB1.4");
        assert_eq!(Address::with_bit(2, 0, 3).to_string(), "DB2.0.3");
    }

    #[test]
    fn test_fallback_payloads() {
        let analog = PointConfig::analog("T1", 1, 0).with_unit("bar");
        let reading = Reading::fallback(&analog, ts()).unwrap();
        assert_eq!(reading.quality, Quality::Bad);
        assert_eq!(
            reading.value,
            ReadingValue::Analog {
                value: 0.0,
                unit: Some("bar".to_string())
            }
        );

        let digital = PointConfig::digital("T2", 2, 0, 5);
        let reading = Reading::fallback(&digital, ts()).unwrap();
        assert_eq!(
            reading.value,
            ReadingValue::Digital {
                value: false,
                bit: 5
            }
        );

        let string = PointConfig::string("S1", 3, 0);
        let reading = Reading::fallback(&string, ts()).unwrap();
        assert_eq!(reading.kind(), PointKind::String);

        let block = PointConfig::data_block("B1", 4, 0);
        assert!(Reading::fallback(&block, ts()).is_none());
    }

    #[test]
    fn test_default_points() {
        let points = default_points();
        let tags: Vec<_> = points.iter().map(|p| p.tag_name.as_str()).collect();
        assert_eq!(
            tags,
            vec!["Temperature_Reactor1", "Pressure_Line1", "Pump_Running"]
        );
        assert!(points.iter().all(|p| p.enabled && p.polling_interval_ms == 5000));
        assert_eq!(points[1].address, Address::new(1, 4));
        assert_eq!(points[2].address.bit, Some(0));
    }

    #[test]
    fn test_quality_codes() {
        assert_eq!(Quality::from_code(Quality::Good.code()), Quality::Good);
        assert_eq!(Quality::from_code(Quality::Bad.code()), Quality::Bad);
        assert_eq!(Quality::from_code(64), Quality::Bad);
    }

    #[test]
    fn test_live_value_projection() {
        let reading = Reading {
            tag_name: "Temperature_Reactor1".to_string(),
            address: Address::new(1, 0),
            quality: Quality::Good,
            timestamp: ts(),
            value: ReadingValue::Analog {
                value: 42.5,
                unit: Some("°C".to_string()),
            },
        };

        let live = reading.to_live_value();
        assert_eq!(live.value, serde_json::json!(42.5));
        assert_eq!(live.unit.as_deref(), Some("°C"));
        assert_eq!(live.quality, 192);
        assert_eq!(live.kind, PointKind::Analog);
    }

    #[test]
    fn test_point_config_deserialize_defaults() {
        let json = r#"{
            "tag_name": "Pump_Running",
            "display_name": "Main Pump Status",
            "kind": "Digital",
            "address": {"block": 2, "offset": 0, "bit": 0}
        }"#;
        let config: PointConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.polling_interval_ms, DEFAULT_POINT_POLLING_INTERVAL_MS);
        assert_eq!(config.address.bit, Some(0));
    }
}
