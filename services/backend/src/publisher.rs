//! Outbound path of the MQTT feed.
//!
//! Configuration commands are encoded with the wire codec and published to
//! [`CONFIG_SET_TOPIC`]. Publishing only reports whether the message was
//! handed to the client; device acknowledgement is not awaited. While the
//! broker is unreachable the client's request channel fills up and further
//! commands fail instead of waiting for a reconnect.

use crate::codec::{encode_device_config, CodecError, DeviceConfig, DEVICE_CONFIG_LEN};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Channel that sensor nodes listen on for configuration changes
pub const CONFIG_SET_TOPIC: &str = "config/set";

/// Errors that can occur while publishing to the feed
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to publish to topic {topic}: {message}")]
    Client { topic: String, message: String },

    #[error("Unsupported QoS level {0}")]
    InvalidQos(u8),
}

/// Errors of the configuration command path
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Encoding(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Message to be published on the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Topic to publish to
    pub topic: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Sink for outbound feed messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedPublisher: Send + Sync {
    /// Submit a message for delivery
    async fn send(&self, message: OutgoingMessage) -> Result<(), PublishError>;
}

/// Map a numeric QoS level onto the client's enum
pub fn qos_level(level: u8) -> Result<QoS, PublishError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(PublishError::InvalidQos(other)),
    }
}

/// Publisher sharing the subscriber's MQTT connection
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl FeedPublisher for MqttPublisher {
    #[instrument(skip(self, message), fields(topic = %message.topic, size = message.payload.len()))]
    async fn send(&self, message: OutgoingMessage) -> Result<(), PublishError> {
        let OutgoingMessage { topic, payload } = message;

        // Never waits for room in the request channel; a full or closed
        // channel is reported as a failed submission
        self.client
            .try_publish(topic.as_str(), self.qos, false, payload)
            .map_err(|e| PublishError::Client {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(topic = %topic, "Message submitted to feed");
        Ok(())
    }
}

/// Encode a device configuration and publish it on [`CONFIG_SET_TOPIC`]
pub async fn publish_device_config(
    publisher: &dyn FeedPublisher,
    config: &DeviceConfig,
) -> Result<[u8; DEVICE_CONFIG_LEN], CommandError> {
    let payload = encode_device_config(config)?;

    publisher
        .send(OutgoingMessage::new(CONFIG_SET_TOPIC, payload))
        .await?;

    info!(
        temperature_threshold = config.temperature_threshold,
        gas_threshold = config.gas_threshold,
        alarms_enabled = config.alarms_enabled,
        interval_secs = config.data_pointing_interval,
        "Device configuration published"
    );

    Ok(payload)
}
