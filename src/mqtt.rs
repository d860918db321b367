//! MQTT event channel
//!
//! Station events are pushed over MQTT. Topic names end with the event
//! name, e.g. `stations/locationUpdate` and `stations/statusUpdate`.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};

use crate::{config::MqttConfig, errors::CommandCenterError, models::ChannelEvent};

const TOPIC_ROOT: &str = "stations";

/// Persistent channel delivering connection signals and station events
pub trait EventSource: Send + 'static {
    /// Next event, or None once the channel is gone for good
    fn recv(&mut self) -> impl Future<Output = Option<ChannelEvent>> + Send;

    /// Terminate the underlying connection
    fn close(self) -> impl Future<Output = ()> + Send;
}

impl EventSource for mpsc::Receiver<ChannelEvent> {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        mpsc::Receiver::recv(self).await
    }

    async fn close(mut self) {
        mpsc::Receiver::close(&mut self);
    }
}

/// MQTT client for receiving station events
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    tx: mpsc::Sender<ChannelEvent>,
    rx: mpsc::Receiver<ChannelEvent>,
    reconnect_delay: Duration,
}

pub struct MqttClient {
    client: AsyncClient,
    rx: mpsc::Receiver<ChannelEvent>,
    handle: tokio::task::JoinHandle<Result<(), CommandCenterError>>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    ///
    /// The bearer token, when given, is sent as the MQTT password.
    pub fn new(config: &MqttConfig, token: Option<&str>) -> Result<Self, CommandCenterError> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.uri, config.port);

        if config.websocket {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
        mqtt_options.set_keep_alive(config.keep_alive);
        if let Some(token) = token {
            mqtt_options.set_credentials(&config.username, token);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        // Create a channel for message passing
        let (tx, rx) = mpsc::channel(100);

        Ok(Self {
            client,
            event_loop,
            tx,
            rx,
            reconnect_delay: config.reconnect_delay,
        })
    }

    /// Start the event loop and subscribe to topics
    ///
    /// Note: Initial subscription needs not be done here, as it is done
    /// in the event loop.
    pub async fn connect(self, topics: &[String]) -> Result<MqttClient, CommandCenterError> {
        let handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(),
            topics.to_vec(),
            self.reconnect_delay,
        ));

        Ok(MqttClient {
            client: self.client,
            rx: self.rx,
            handle,
        })
    }

    async fn subscribe(client: AsyncClient, topics: &[String]) -> Result<(), CommandCenterError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on the next poll after a connection error, but
    /// topic subscriptions need to be re-established, so subscribing happens
    /// on every connection acknowledgement. Connection errors are followed by
    /// a fixed delay before the next attempt.
    ///
    /// NOTE: The loop stops for good when the broker refuses our
    /// credentials, or when topic subscription fails.
    async fn process_events(
        tx: mpsc::Sender<ChannelEvent>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
        reconnect_delay: Duration,
    ) -> Result<(), CommandCenterError> {
        let mut connected = false;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(client.clone(), &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                    connected = true;
                    if tx.send(ChannelEvent::Connected).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Self::parse_message(&publish.topic, &publish.payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                debug!("Event receiver dropped, stopping MQTT loop");
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse message on {}: {}", publish.topic, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the MQTT session");
                    if std::mem::take(&mut connected)
                        && tx.send(ChannelEvent::Disconnected).await.is_err()
                    {
                        break Ok(());
                    }
                }
                Err(e) => {
                    if let Some(reason) = auth_refusal(&e) {
                        error!("MQTT broker refused credentials: {}", reason);
                        let _ = tx.send(ChannelEvent::Rejected(reason.clone())).await;
                        break Err(CommandCenterError::ChannelRejected(reason));
                    }
                    error!("MQTT Error: {}", e);
                    if std::mem::take(&mut connected)
                        && tx.send(ChannelEvent::Disconnected).await.is_err()
                    {
                        break Ok(());
                    }
                    tokio::time::sleep(reconnect_delay).await;
                }
                _ => continue,
            }
        }
    }

    /// Parse incoming message based on topic
    fn parse_message(topic: &str, payload: &[u8]) -> Result<ChannelEvent, CommandCenterError> {
        let parts: Vec<&str> = topic.split('/').collect();

        // Validate topic structure
        if parts.len() < 2 || parts[0] != TOPIC_ROOT {
            return Err(CommandCenterError::InvalidTopic(topic.to_string()));
        }

        match parts[parts.len() - 1] {
            "locationUpdate" => Ok(ChannelEvent::LocationUpdate(serde_json::from_slice(
                payload,
            )?)),
            "statusUpdate" => Ok(ChannelEvent::StatusUpdate(serde_json::from_slice(payload)?)),
            other => Err(CommandCenterError::UnknownEventType(other.to_string())),
        }
    }
}

/// Reason for a connection failure that retrying cannot fix.
///
/// The broker refuses bad credentials in its CONNACK. Behind a WebSocket
/// proxy the same refusal arrives as a 401 or 403 answer to the upgrade
/// request.
fn auth_refusal(error: &ConnectionError) -> Option<String> {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => Some(format!("{:?}", code)),
        ConnectionError::Websocket(e) => is_http_auth_failure(&e.to_string()).then(|| e.to_string()),
        _ => None,
    }
}

/// Matches the message of a rejected WebSocket upgrade, e.g.
/// `HTTP error: 401 Unauthorized`
fn is_http_auth_failure(message: &str) -> bool {
    message
        .strip_prefix("HTTP error: ")
        .is_some_and(|status| status.starts_with("401") || status.starts_with("403"))
}

impl MqttClient {
    /// Receive next event
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Stop the event loop, dropping the broker connection
    pub async fn disconnect(self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {}", e);
        }
        self.handle.abort();
        match self.handle.await {
            Ok(Err(e)) => warn!("MQTT loop ended with error: {}", e),
            Err(e) if !e.is_cancelled() => warn!("MQTT loop failed: {}", e),
            _ => {}
        }
        info!("MQTT channel closed");
    }
}

impl EventSource for MqttClient {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        MqttClient::recv(self).await
    }

    async fn close(self) {
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{LocationFix, LocationUpdate, StationId, StationStatus, StatusUpdate};

    use super::*;

    #[test]
    fn parse_location_message() {
        let topic = "stations/locationUpdate";
        let payload = r#"{
            "stationId":"7101",
            "latitude":16.705,
            "longitude":74.2433,
            "status":"OUTSIDE",
            "distance":240.5,
            "assignedLatitude":16.7049,
            "assignedLongitude":74.2432,
            "allowedRadiusMeters":50
        }"#
        .as_bytes();

        let message = MqttClientBuilder::parse_message(topic, payload).unwrap();

        let expected = ChannelEvent::LocationUpdate(LocationUpdate {
            station_id: StationId::try_from("7101").unwrap(),
            fix: LocationFix {
                latitude: Some(16.705),
                longitude: Some(74.2433),
                status: Some(StationStatus::Outside),
                distance: Some(240.5),
                assigned_latitude: Some(16.7049),
                assigned_longitude: Some(74.2432),
                allowed_radius_meters: Some(50.0),
            },
        });

        assert_eq!(message, expected);
    }

    #[test]
    fn parse_status_message() {
        let topic = "stations/district/72/statusUpdate";
        let payload = r#"{"stationId":7205,"status":"OFFLINE"}"#.as_bytes();

        let message = MqttClientBuilder::parse_message(topic, payload).unwrap();

        let expected = ChannelEvent::StatusUpdate(StatusUpdate {
            station_id: StationId::try_from("7205").unwrap(),
            status: StationStatus::Offline,
        });

        assert_eq!(message, expected);
    }

    #[test]
    fn reject_message_without_station_id() {
        let payload = r#"{"latitude":16.705,"longitude":74.2433}"#.as_bytes();

        assert!(matches!(
            MqttClientBuilder::parse_message("stations/locationUpdate", payload),
            Err(CommandCenterError::SerdeError(_))
        ));
    }

    #[test]
    fn reject_unknown_topics() {
        assert!(matches!(
            MqttClientBuilder::parse_message("devices/locationUpdate", b"{}"),
            Err(CommandCenterError::InvalidTopic(_))
        ));
        assert!(matches!(
            MqttClientBuilder::parse_message("stations/heartbeat", b"{}"),
            Err(CommandCenterError::UnknownEventType(_))
        ));
    }

    #[test]
    fn credential_refusals_stop_reconnecting() {
        assert_eq!(
            auth_refusal(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::NotAuthorized
            )),
            Some("NotAuthorized".to_string())
        );
        assert!(auth_refusal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        ))
        .is_some());
        assert_eq!(
            auth_refusal(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::ServiceUnavailable
            )),
            None
        );
        assert_eq!(auth_refusal(&ConnectionError::NetworkTimeout), None);
    }

    #[test]
    fn rejected_websocket_upgrade_is_an_auth_failure() {
        assert!(is_http_auth_failure("HTTP error: 401 Unauthorized"));
        assert!(is_http_auth_failure("HTTP error: 403 Forbidden"));
        assert!(!is_http_auth_failure("HTTP error: 502 Bad Gateway"));
        assert!(!is_http_auth_failure("Connection closed normally"));
    }

    #[tokio::test]
    async fn channel_receiver_is_an_event_source() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(ChannelEvent::Connected).await.unwrap();
        drop(tx);

        assert_eq!(EventSource::recv(&mut rx).await, Some(ChannelEvent::Connected));
        assert_eq!(EventSource::recv(&mut rx).await, None);
        EventSource::close(rx).await;
    }
}
