use crate::codec::{
    decode_device_config, decode_risk_level, decode_sensor_reading, CodecError, DeviceConfig,
};
use crate::config::MqttConfig;
use crate::publisher::{qos_level, MqttPublisher, PublishError};
use crate::store::{StoreError, TelemetryStore};
use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Inbound channels the backend subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Sensor readings
    Sensors,
    /// Risk ordinals
    Risk,
    /// Configuration echoed back by devices
    Config,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sensors, Channel::Risk, Channel::Config];

    pub fn topic(self) -> &'static str {
        match self {
            Channel::Sensors => "sensors",
            Channel::Risk => "risk",
            Channel::Config => "config",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.topic() == topic)
    }
}

/// Raw message received from the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// What the ingest worker did with a message
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    SensorReading { id: i64 },
    RiskEvent { id: i64 },
    /// Device config echo, decoded but not stored
    ConfigEcho(DeviceConfig),
    /// Topic is not one of ours
    Ignored,
}

/// Failure to ingest a single message
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to decode {channel:?} payload: {source}")]
    Decode {
        channel: Channel,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decodes feed messages and appends them to the store
#[derive(Clone)]
pub struct IngestHandler {
    store: Arc<TelemetryStore>,
}

impl IngestHandler {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self { store }
    }

    /// Dispatch one message by channel
    #[instrument(skip(self, message), fields(topic = %message.topic, size = message.payload.len()))]
    pub async fn handle(&self, message: &FeedMessage) -> Result<Ingested, IngestError> {
        let Some(channel) = Channel::from_topic(&message.topic) else {
            return Ok(Ingested::Ignored);
        };
        let decode_error = |source: CodecError| IngestError::Decode { channel, source };

        match channel {
            Channel::Sensors => {
                let reading = decode_sensor_reading(&message.payload).map_err(decode_error)?;
                let id = self.store.insert_sensor_reading(&reading).await?;
                debug!(
                    id,
                    temperature = reading.temperature,
                    gas_level = reading.gas_level,
                    flame_detected = reading.flame_detected,
                    "Sensor reading ingested"
                );
                Ok(Ingested::SensorReading { id })
            }
            Channel::Risk => {
                let level = decode_risk_level(&message.payload).map_err(decode_error)?;
                let id = self.store.insert_risk_event(level).await?;
                debug!(id, risk_level = level.raw(), class = ?level.class(), "Risk event ingested");
                Ok(Ingested::RiskEvent { id })
            }
            Channel::Config => {
                let config = decode_device_config(&message.payload).map_err(decode_error)?;
                info!(?config, "Device reported configuration");
                Ok(Ingested::ConfigEcho(config))
            }
        }
    }

    /// Drain the ingest queue until every sender is gone.
    ///
    /// Failures are logged and the message is dropped; nothing is retried.
    pub async fn run(self, mut queue: mpsc::Receiver<FeedMessage>) {
        info!("Ingest worker started");

        while let Some(message) = queue.recv().await {
            match self.handle(&message).await {
                Ok(Ingested::Ignored) => {
                    debug!(topic = %message.topic, "Ignoring message on unknown topic");
                    metrics::counter!("feed.messages.ignored").increment(1);
                }
                Ok(_) => {
                    metrics::counter!("feed.messages.ingested").increment(1);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        topic = %message.topic,
                        payload_len = message.payload.len(),
                        "Failed to ingest message"
                    );
                    metrics::counter!("feed.messages.failed").increment(1);
                }
            }
        }

        info!("Ingest worker stopped");
    }
}

/// Open the MQTT connection and split it into its outbound and inbound halves.
///
/// The client library reconnects on the next poll after a failure; the
/// subscriber only has to keep polling.
pub fn connect(config: &MqttConfig) -> Result<(MqttPublisher, FeedSubscriber), PublishError> {
    let qos = qos_level(config.qos)?;

    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options
        .set_keep_alive(config.keep_alive())
        .set_clean_session(config.clean_session);

    let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

    info!(
        host = %config.host,
        port = config.port,
        client_id = %config.client_id,
        "MQTT client created"
    );

    let publisher = MqttPublisher::new(client.clone(), qos);
    let subscriber = FeedSubscriber {
        client,
        eventloop,
        qos,
        queue_capacity: config.queue_capacity,
        reconnect_delay: config.reconnect_delay(),
    };

    Ok((publisher, subscriber))
}

/// Inbound half of the MQTT connection
pub struct FeedSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
    queue_capacity: usize,
    reconnect_delay: Duration,
}

impl FeedSubscriber {
    /// Poll the connection and hand every publish to the ingest worker.
    ///
    /// Returns only if the worker goes away.
    pub async fn run(mut self, handler: IngestHandler) -> Result<()> {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let worker = tokio::spawn(handler.run(queue_rx));

        info!("Starting MQTT feed subscriber");

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(session_present = ack.session_present, "MQTT connection up");
                    // Subscriptions are renewed on every (re)connect
                    self.subscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    metrics::counter!("feed.messages.received").increment(1);
                    let message = FeedMessage::new(publish.topic, publish.payload.to_vec());
                    if queue_tx.send(message).await.is_err() {
                        worker.abort();
                        bail!("Ingest worker stopped");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(
                        pkid = ack.pkid,
                        return_codes = ?ack.return_codes,
                        "Subscription acknowledged"
                    );
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Server requested disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection down");
                    metrics::counter!("feed.connection.errors").increment(1);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Request the feed subscriptions without blocking the poll loop.
    ///
    /// The request may have to wait behind publishes queued while the broker
    /// was down, which only drain as the loop keeps polling.
    fn subscribe(&self) {
        let client = self.client.clone();
        let filters: Vec<SubscribeFilter> = Channel::ALL
            .into_iter()
            .map(|channel| SubscribeFilter::new(channel.topic().to_string(), self.qos))
            .collect();

        tokio::spawn(async move {
            match client.subscribe_many(filters).await {
                Ok(()) => info!(
                    topics = ?Channel::ALL.map(Channel::topic),
                    "MQTT subscription requested"
                ),
                Err(e) => error!(
                    error = %e,
                    "Failed to subscribe; no messages will be received on this connection"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RiskLevel;
    use crate::publisher::{FeedPublisher, OutgoingMessage, CONFIG_SET_TOPIC};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn handler() -> (IngestHandler, Arc<TelemetryStore>) {
        let store = Arc::new(TelemetryStore::in_memory().await.unwrap());
        (IngestHandler::new(store.clone()), store)
    }

    #[test]
    fn test_channel_from_topic() {
        assert_eq!(Channel::from_topic("sensors"), Some(Channel::Sensors));
        assert_eq!(Channel::from_topic("risk"), Some(Channel::Risk));
        assert_eq!(Channel::from_topic("config"), Some(Channel::Config));
        assert_eq!(Channel::from_topic("config/set"), None);
        assert_eq!(Channel::from_topic("Sensors"), None);
    }

    #[tokio::test]
    async fn test_sensor_message_is_stored() {
        let (handler, store) = handler().await;

        let outcome = handler
            .handle(&FeedMessage::new("sensors", vec![0x10, 0x27, 0x32, 0x00, 0x01]))
            .await
            .unwrap();
        assert!(matches!(outcome, Ingested::SensorReading { .. }));

        let latest = store.latest_sensor_reading().await.unwrap().unwrap();
        assert_eq!(latest.temperature, 100.0);
        assert_eq!(latest.gas_level, 50);
        assert!(latest.flame_detected);
    }

    #[tokio::test]
    async fn test_risk_message_uses_first_byte() {
        let (handler, store) = handler().await;

        handler
            .handle(&FeedMessage::new("risk", vec![1, 0xff]))
            .await
            .unwrap();

        let latest = store.latest_risk_event().await.unwrap().unwrap();
        assert_eq!(latest.level(), RiskLevel::MODERATE);
    }

    #[tokio::test]
    async fn test_config_echo_is_not_stored() {
        let (handler, store) = handler().await;

        let outcome = handler
            .handle(&FeedMessage::new("config", vec![0xDE, 0x0D, 0x2C, 0x01, 0x00, 0x05]))
            .await
            .unwrap();

        match outcome {
            Ingested::ConfigEcho(config) => {
                assert_eq!(config.temperature_threshold, 35.5);
                assert_eq!(config.gas_threshold, 300);
                assert!(!config.alarms_enabled);
                assert_eq!(config.data_pointing_interval, 5);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sensor_readings, 0);
        assert_eq!(stats.risk_events, 0);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_ignored() {
        let (handler, _) = handler().await;
        let outcome = handler
            .handle(&FeedMessage::new("config/set", vec![0; 6]))
            .await
            .unwrap();
        assert_eq!(outcome, Ingested::Ignored);
    }

    #[tokio::test]
    async fn test_short_payload_is_a_decode_error() {
        let (handler, store) = handler().await;

        let err = handler
            .handle(&FeedMessage::new("sensors", vec![0x10, 0x27]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Decode {
                channel: Channel::Sensors,
                source: CodecError::MalformedPayload { .. }
            }
        ));

        let err = handler.handle(&FeedMessage::new("risk", vec![])).await.unwrap_err();
        assert!(matches!(err, IngestError::Decode { channel: Channel::Risk, .. }));

        assert_eq!(store.latest_sensor_reading().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_survives_bad_messages() {
        let (handler, store) = handler().await;
        let (tx, rx) = mpsc::channel(8);

        tx.send(FeedMessage::new("sensors", vec![0x01])).await.unwrap();
        tx.send(FeedMessage::new("risk", vec![2])).await.unwrap();
        tx.send(FeedMessage::new("risk", vec![])).await.unwrap();
        tx.send(FeedMessage::new("unknown", vec![1, 2, 3])).await.unwrap();
        tx.send(FeedMessage::new("sensors", vec![0xC4, 0x09, 0x0A, 0x00, 0x00]))
            .await
            .unwrap();
        drop(tx);

        handler.run(rx).await;

        let readings = store.sensor_readings(10).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].temperature, 25.0);
        assert_eq!(readings[0].gas_level, 10);

        let risks = store.risk_events(10).await.unwrap();
        assert_eq!(risks.len(), 1);
        assert!(risks[0].level().is_high());
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[tokio::test]
    async fn test_subscription_is_sent_behind_queued_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            client_id: "feed-test".to_string(),
            qos: 0,
            channel_capacity: 1,
            ..MqttConfig::default()
        };
        let (publisher, subscriber) = connect(&config).unwrap();

        // broker not accepted yet: the request channel fills up
        let command =
            OutgoingMessage::new(CONFIG_SET_TOPIC, vec![0xDE, 0x0D, 0x2C, 0x01, 0x01, 0x0A]);
        publisher.send(command.clone()).await.unwrap();
        assert!(publisher.send(command).await.is_err());

        let (handler, _store) = handler().await;
        let feed = tokio::spawn(subscriber.run(handler));

        let (mut socket, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], 0x10, "expected CONNECT");

        // CONNACK, session not present, accepted
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut received = Vec::new();
        while !contains(&received, b"sensors") {
            let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
                .await
                .expect("subscription was never sent")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            received.extend_from_slice(&buf[..n]);
        }

        assert!(contains(&received, b"config/set"));
        assert!(contains(&received, b"risk"));

        feed.abort();
    }
}
