use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::shared::config::MqttConfig;
use crate::shared::errors::{ConfigError, TransportError};

/// QoS and retain flag of one publish, as stored alongside queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self::at_least_once()
    }
}

impl DeliveryOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: 1,
            retain: false,
        }
    }

    pub fn retained() -> Self {
        Self {
            qos: 1,
            retain: true,
        }
    }

    pub fn qos(&self) -> QoS {
        qos_from_u8(self.qos)
    }
}

/// Unknown levels are treated as QoS 1.
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Outgoing side of the bus, as seen by the edge session.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hands the publish to the client. `Ok` does not mean the broker has it:
    /// delivery is confirmed later by the event loop's PUBACK.
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        options: DeliveryOptions,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;
}

/// `AsyncClient` plus the connection flag maintained by whoever polls the event loop.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    publish_timeout: Duration,
}

impl MqttClient {
    /// Creates the client and its event loop. `capacity` bounds the request channel
    /// between the two.
    pub fn new(
        options: MqttOptions,
        capacity: usize,
        publish_timeout: Duration,
    ) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, capacity);
        let mqtt_client = MqttClient {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            publish_timeout,
        };
        (mqtt_client, eventloop)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            log::warn!("Connection lost with broker.");
        }
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        options: DeliveryOptions,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let publish = self.client.publish(
            topic,
            options.qos(),
            options.retain,
            payload.as_bytes().to_vec(),
        );
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => {
                result?;
                log::debug!("Data sent to topic '{}'", topic);
                Ok(())
            }
            Err(_) => Err(TransportError::Timeout {
                topic: topic.to_string(),
            }),
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }
}

/// Builds connection options from config: keep alive, credentials, TLS and an
/// optional last will.
pub fn build_options(
    config: &MqttConfig,
    client_id: &str,
    last_will: Option<LastWill>,
) -> Result<MqttOptions, ConfigError> {
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive.max(5).into()));
    options.set_clean_session(false);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }

    if let Some(ca_cert) = &config.ca_cert {
        let ca = load_certificate(ca_cert)?;
        let client_auth = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => Some((load_certificate(cert)?, load_certificate(key)?)),
            _ => None,
        };

        let tls_config = TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        };
        options.set_transport(rumqttc::Transport::tls_with_config(tls_config));
    } else if config.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    if let Some(will) = last_will {
        options.set_last_will(will);
    }

    Ok(options)
}

fn load_certificate(path: &str) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Certificate {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_options_qos_mapping() {
        assert_eq!(DeliveryOptions::default().qos(), QoS::AtLeastOnce);
        assert_eq!(DeliveryOptions { qos: 0, retain: false }.qos(), QoS::AtMostOnce);
        assert_eq!(DeliveryOptions { qos: 2, retain: false }.qos(), QoS::ExactlyOnce);
        assert_eq!(DeliveryOptions { qos: 7, retain: false }.qos(), QoS::AtLeastOnce);
        assert!(DeliveryOptions::retained().retain);
    }

    #[test]
    fn test_delivery_options_json_shape() {
        let parsed: DeliveryOptions = serde_json::from_str(r#"{"qos":1}"#).unwrap();
        assert_eq!(parsed, DeliveryOptions::at_least_once());
        assert_eq!(
            serde_json::to_string(&DeliveryOptions::retained()).unwrap(),
            r#"{"qos":1,"retain":true}"#
        );
    }

    #[test]
    fn test_build_options() {
        let config = MqttConfig {
            broker: "bus.internal".to_string(),
            port: 1885,
            username: Some("edge".to_string()),
            password: Some("secret".to_string()),
            ..MqttConfig::default()
        };
        let will = LastWill::new("a/sys/status", "offline", QoS::AtLeastOnce, true);

        let options = build_options(&config, "rentio-test", Some(will)).unwrap();
        assert_eq!(options.broker_address(), ("bus.internal".to_string(), 1885));
        assert_eq!(options.client_id(), "rentio-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("edge".to_string(), "secret".to_string()))
        );
        assert_eq!(options.last_will().map(|w| w.topic), Some("a/sys/status".to_string()));
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let config = MqttConfig {
            ca_cert: Some("/no/such/ca.pem".to_string()),
            ..MqttConfig::default()
        };
        let err = build_options(&config, "rentio-test", None).unwrap_err();
        assert!(matches!(err, ConfigError::Certificate { .. }));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let (client, _eventloop) = MqttClient::new(
            MqttOptions::new("rentio-test", "localhost", 1883),
            10,
            Duration::from_millis(100),
        );

        let err = client
            .publish("a/b", "{}", DeliveryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));

        client.set_connected(true);
        assert!(client.is_connected());
        client
            .publish("a/b", "{}", DeliveryOptions::default())
            .await
            .unwrap();
    }
}
