//! Fixed-layout binary wire codec for sensor node payloads.
//!
//! All payloads are little-endian with no length prefix and no checksum:
//!
//! ```text
//! sensors     ┌──────────────┬──────────┬───────────┐
//! (>= 5)      │ temp×100 u16 │ gas u16  │ flame u8  │
//!             └──────────────┴──────────┴───────────┘
//! risk        ┌──────────────┐
//! (>= 1)      │ ordinal u8   │
//!             └──────────────┘
//! config      ┌──────────────┬──────────┬───────────┬─────────────┐
//! (6)         │ temp×100 u16 │ gas u16  │ alarms u8 │ interval u8 │
//!             └──────────────┴──────────┴───────────┴─────────────┘
//! ```
//!
//! Decoders ignore trailing bytes beyond the layout.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum length of a `sensors` payload.
pub const SENSOR_READING_LEN: usize = 5;

/// Minimum length of a `risk` payload.
pub const RISK_LEVEL_LEN: usize = 1;

/// Exact length of an encoded device configuration.
pub const DEVICE_CONFIG_LEN: usize = 6;

/// Fixed-point scale of temperature fields (hundredths of a degree).
const TEMPERATURE_SCALE: f64 = 100.0;

/// Errors produced by the wire codec
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("malformed {kind} payload: {actual} bytes, expected at least {expected}")]
    MalformedPayload {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} value {value} does not fit its wire field")]
    EncodingOverflow { field: &'static str, value: f64 },
}

/// Reading reported by a sensor node on the `sensors` channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    /// Temperature in degrees, recovered from hundredths
    pub temperature: f64,
    /// Raw gas sensor level
    pub gas_level: u16,
    /// Whether the flame sensor fired
    pub flame_detected: bool,
}

/// Named band of a risk ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Moderate,
    High,
    /// Ordinal outside the defined bands
    Unknown,
}

/// Risk ordinal reported on the `risk` channel.
///
/// Any `u8` is accepted and kept verbatim; only 0, 1 and 2 carry a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiskLevel(pub u8);

impl RiskLevel {
    pub const LOW: RiskLevel = RiskLevel(0);
    pub const MODERATE: RiskLevel = RiskLevel(1);
    pub const HIGH: RiskLevel = RiskLevel(2);

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_low(self) -> bool {
        self == Self::LOW
    }

    pub fn is_moderate(self) -> bool {
        self == Self::MODERATE
    }

    pub fn is_high(self) -> bool {
        self == Self::HIGH
    }

    pub fn class(self) -> RiskClass {
        match self.0 {
            0 => RiskClass::Low,
            1 => RiskClass::Moderate,
            2 => RiskClass::High,
            _ => RiskClass::Unknown,
        }
    }
}

impl From<u8> for RiskLevel {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// Configuration pushed to sensor nodes on `config/set`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Temperature alarm threshold in degrees (hundredths precision on the wire)
    pub temperature_threshold: f64,
    /// Gas alarm threshold
    pub gas_threshold: u16,
    /// Whether the node drives its alarms
    pub alarms_enabled: bool,
    /// Seconds between device transmissions
    pub data_pointing_interval: u8,
}

fn ensure_len(kind: &'static str, bytes: &[u8], expected: usize) -> Result<(), CodecError> {
    if bytes.len() < expected {
        return Err(CodecError::MalformedPayload {
            kind,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn scaled_temperature(raw: u16) -> f64 {
    f64::from(raw) / TEMPERATURE_SCALE
}

/// Decode a `sensors` payload.
pub fn decode_sensor_reading(bytes: &[u8]) -> Result<SensorReading, CodecError> {
    ensure_len("sensor reading", bytes, SENSOR_READING_LEN)?;

    Ok(SensorReading {
        temperature: scaled_temperature(read_u16(bytes, 0)),
        gas_level: read_u16(bytes, 2),
        flame_detected: bytes[4] != 0,
    })
}

/// Decode a `risk` payload. Only the first byte is significant.
pub fn decode_risk_level(bytes: &[u8]) -> Result<RiskLevel, CodecError> {
    ensure_len("risk", bytes, RISK_LEVEL_LEN)?;
    Ok(RiskLevel(bytes[0]))
}

/// Decode a device configuration payload.
pub fn decode_device_config(bytes: &[u8]) -> Result<DeviceConfig, CodecError> {
    ensure_len("device config", bytes, DEVICE_CONFIG_LEN)?;

    Ok(DeviceConfig {
        temperature_threshold: scaled_temperature(read_u16(bytes, 0)),
        gas_threshold: read_u16(bytes, 2),
        alarms_enabled: bytes[4] != 0,
        data_pointing_interval: bytes[5],
    })
}

/// Encode a device configuration for `config/set`.
///
/// The temperature threshold is rounded to the nearest hundredth. Values that
/// are negative, non-finite or above 655.35 fail with
/// [`CodecError::EncodingOverflow`].
pub fn encode_device_config(config: &DeviceConfig) -> Result<[u8; DEVICE_CONFIG_LEN], CodecError> {
    let scaled = (config.temperature_threshold * TEMPERATURE_SCALE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > f64::from(u16::MAX) {
        return Err(CodecError::EncodingOverflow {
            field: "temperatureThreshold",
            value: config.temperature_threshold,
        });
    }
    let temperature = scaled as u16;

    let mut buf = [0u8; DEVICE_CONFIG_LEN];
    buf[0..2].copy_from_slice(&temperature.to_le_bytes());
    buf[2..4].copy_from_slice(&config.gas_threshold.to_le_bytes());
    buf[4] = u8::from(config.alarms_enabled);
    buf[5] = config.data_pointing_interval;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> DeviceConfig {
        DeviceConfig {
            temperature_threshold: 35.5,
            gas_threshold: 300,
            alarms_enabled: true,
            data_pointing_interval: 10,
        }
    }

    #[test]
    fn test_decode_sensor_reading() {
        let reading = decode_sensor_reading(&[0x10, 0x27, 0x32, 0x00, 0x01]).unwrap();
        assert_eq!(reading.temperature, 100.0);
        assert_eq!(reading.gas_level, 50);
        assert!(reading.flame_detected);
    }

    #[test]
    fn test_decode_sensor_reading_ignores_trailing_bytes() {
        let reading = decode_sensor_reading(&[0x10, 0x27, 0x00, 0x32, 0x00, 0x01]).unwrap();
        assert_eq!(reading.temperature, 100.0);
        assert_eq!(reading.gas_level, 0x3200);
        assert!(!reading.flame_detected);
    }

    #[test]
    fn test_flame_is_any_nonzero_byte() {
        let reading = decode_sensor_reading(&[0, 0, 0, 0, 0x7f]).unwrap();
        assert!(reading.flame_detected);

        let reading = decode_sensor_reading(&[0, 0, 0, 0, 0]).unwrap();
        assert!(!reading.flame_detected);
    }

    #[test]
    fn test_short_payloads_are_malformed() {
        for len in 0..SENSOR_READING_LEN {
            let bytes = vec![0xffu8; len];
            assert!(matches!(
                decode_sensor_reading(&bytes),
                Err(CodecError::MalformedPayload { expected: 5, actual, .. }) if actual == len
            ));
        }
        for len in 0..DEVICE_CONFIG_LEN {
            let bytes = vec![0xffu8; len];
            assert!(matches!(
                decode_device_config(&bytes),
                Err(CodecError::MalformedPayload { expected: 6, .. })
            ));
        }
        assert!(matches!(
            decode_risk_level(&[]),
            Err(CodecError::MalformedPayload { expected: 1, actual: 0, .. })
        ));
    }

    #[test]
    fn test_decode_risk_uses_first_byte() {
        assert_eq!(decode_risk_level(&[2, 9, 9]).unwrap(), RiskLevel::HIGH);
        assert_eq!(decode_risk_level(&[7]).unwrap(), RiskLevel(7));
    }

    #[test]
    fn test_risk_classification() {
        assert!(RiskLevel(0).is_low());
        assert!(RiskLevel(1).is_moderate());
        assert!(RiskLevel(2).is_high());
        assert_eq!(RiskLevel(1).class(), RiskClass::Moderate);
        assert_eq!(RiskLevel(3).class(), RiskClass::Unknown);
        assert!(!RiskLevel(3).is_low() && !RiskLevel(3).is_moderate() && !RiskLevel(3).is_high());
    }

    #[test]
    fn test_encode_device_config() {
        let bytes = encode_device_config(&sample_config()).unwrap();
        // 3550 = 0x0DDE, 300 = 0x012C
        assert_eq!(bytes, [0xDE, 0x0D, 0x2C, 0x01, 0x01, 0x0A]);
    }

    #[test]
    fn test_device_config_round_trip() {
        let configs = [
            sample_config(),
            DeviceConfig {
                temperature_threshold: 0.0,
                gas_threshold: 0,
                alarms_enabled: false,
                data_pointing_interval: 0,
            },
            DeviceConfig {
                temperature_threshold: 655.35,
                gas_threshold: u16::MAX,
                alarms_enabled: true,
                data_pointing_interval: u8::MAX,
            },
            DeviceConfig {
                temperature_threshold: 21.37,
                gas_threshold: 1234,
                alarms_enabled: false,
                data_pointing_interval: 60,
            },
        ];

        for config in configs {
            let decoded = decode_device_config(&encode_device_config(&config).unwrap()).unwrap();
            assert!((decoded.temperature_threshold - config.temperature_threshold).abs() < 0.005);
            assert_eq!(decoded.gas_threshold, config.gas_threshold);
            assert_eq!(decoded.alarms_enabled, config.alarms_enabled);
            assert_eq!(decoded.data_pointing_interval, config.data_pointing_interval);
        }
    }

    #[test]
    fn test_encode_rejects_out_of_range_threshold() {
        for threshold in [655.36, -0.5, 1.0e9, f64::NAN, f64::INFINITY] {
            let config = DeviceConfig {
                temperature_threshold: threshold,
                ..sample_config()
            };
            assert!(matches!(
                encode_device_config(&config),
                Err(CodecError::EncodingOverflow { field: "temperatureThreshold", .. })
            ));
        }
    }

    #[test]
    fn test_device_config_json_field_names() {
        let json = r#"{
            "temperatureThreshold": 35.5,
            "gasThreshold": 300,
            "alarmsEnabled": true,
            "dataPointingInterval": 10
        }"#;

        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, sample_config());
    }
}
