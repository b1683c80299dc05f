//! IoT Telemetry Backend
//!
//! Ingests telemetry from embedded sensor nodes over an MQTT feed, persists it
//! in SQLite, and serves it over an HTTP/JSON API. Operators push device
//! configuration through the same API; it is encoded and published back to
//! the nodes on `config/set`.
//!
//! ## Architecture
//!
//! ```text
//!  Sensor nodes                                          API clients
//!       │ ▲                                                  │ ▲
//!       │ │ config/set                                       │ │
//!       ▼ │                                                  ▼ │
//! ┌──────────────┐  FeedMessage  ┌──────────────┐      ┌──────────────┐
//! │ MQTT feed    │──────────────▶│ Ingest       │      │ Query /      │
//! │ (subscriber) │    (queue)    │ worker       │      │ Command API  │
//! └──────────────┘               └──────────────┘      └──────────────┘
//!       ▲                               │ codec::decode_*   │      │
//!       │                               ▼                   │      │
//! ┌──────────────┐               ┌──────────────┐           │      │
//! │ Publisher    │◀──────────────│──────────────│───────────┘      │
//! │              │ encode_device │ Telemetry    │◀─────────────────┘
//! └──────────────┘    _config    │ Store        │   query_*
//!                                └──────────────┘
//! ```
//!
//! ## Wire channels
//!
//! - `sensors`: temperature, gas level and flame flag (5 bytes)
//! - `risk`: risk ordinal (1 byte)
//! - `config`: configuration echoed by a device (6 bytes, logged only)
//! - `config/set`: configuration pushed to devices (6 bytes)

pub mod api;
pub mod codec;
pub mod config;
pub mod feed;
pub mod publisher;
pub mod store;

pub use api::{create_router, start_api_server, ApiError, AppState};
pub use codec::{
    decode_device_config, decode_risk_level, decode_sensor_reading, encode_device_config,
    CodecError, DeviceConfig, RiskClass, RiskLevel, SensorReading,
};
pub use config::Config;
pub use feed::{connect, Channel, FeedMessage, FeedSubscriber, IngestError, IngestHandler};
pub use publisher::{
    publish_device_config, CommandError, FeedPublisher, MqttPublisher, OutgoingMessage,
    PublishError, CONFIG_SET_TOPIC,
};
pub use store::{RiskEventRecord, SensorReadingRecord, StoreError, StoreStats, TelemetryStore};
