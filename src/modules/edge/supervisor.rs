use chrono::Utc;
use rumqttc::{LastWill, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

use super::commands::{ack_data, execution_data, parse_command, AckStatus, Command, INVALID_JSON};
use super::dedup::CommandDedup;
use super::outbox::{Outbox, OutboxMessage};
use crate::modules::mqtt::envelope::Envelope;
use crate::modules::mqtt::mqtt_client::{DeliveryOptions, Transport};
use crate::modules::mqtt::topic::{BaseTopic, Channel, Location};
use crate::shared::config::EdgeConfig;
use crate::shared::errors::{ConfigError, TransportError};

const HELLO_SUFFIX: &str = "system/hello";

/// Retained offline status the broker publishes for us if the connection dies.
pub fn last_will(location: &Location) -> Result<LastWill, ConfigError> {
    let envelope = Envelope::new(location, json!({ "status": "offline" }));
    let payload = serde_json::to_vec(&envelope).map_err(ConfigError::LastWill)?;
    Ok(LastWill::new(
        BaseTopic::new(location).status_topic(),
        payload,
        QoS::AtLeastOnce,
        true,
    ))
}

struct Hello {
    token: String,
    version: String,
}

/// Presence and command handling for one gateway.
///
/// Owns the outbox and the dedup table; the driver loop feeds it connection
/// events, timer ticks and inbound publishes, one at a time.
pub struct EdgeSession<T: Transport> {
    location: Location,
    base: BaseTopic,
    transport: T,
    outbox: Outbox,
    dedup: CommandDedup,
    hello: Option<Hello>,
    hello_sent: bool,
}

impl<T: Transport> EdgeSession<T> {
    pub async fn open(config: &EdgeConfig, transport: T) -> Self {
        let location = Location {
            tenant: config.tenant.clone(),
            building: config.building.clone(),
            gateway: config.gateway.clone(),
        };
        let outbox = Outbox::load(&config.queue_file, config.max_queue, config.flush_retry)
            .await
            .with_ack_timeout(Duration::from_millis(config.ack_timeout_ms));
        let dedup = CommandDedup::load(
            &config.dedup_file,
            config.dedup_max_entries,
            chrono::Duration::seconds(config.dedup_ttl_secs.min(u32::MAX as u64) as i64),
        )
        .await;
        let hello = config
            .provisioning_token
            .as_ref()
            .filter(|token| !token.is_empty())
            .map(|token| Hello {
                token: token.clone(),
                version: config.agent_version.clone(),
            });

        EdgeSession {
            base: BaseTopic::new(&location),
            location,
            transport,
            outbox,
            dedup,
            hello,
            hello_sent: false,
        }
    }

    pub fn base(&self) -> &BaseTopic {
        &self.base
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Announces presence, subscribes to commands and drains the queue.
    pub async fn on_connected(&mut self) {
        log::info!("Gateway {} connected", self.base);

        let online = Envelope::new(&self.location, json!({ "status": "online" }));
        self.send(self.base.status_topic(), online, DeliveryOptions::retained())
            .await;

        if !self.hello_sent {
            if let Some(hello) = &self.hello {
                let envelope = Envelope::new(
                    &self.location,
                    json!({ "token": hello.token, "version": hello.version }),
                );
                let topic = self.base.topic_for(Channel::Evt, HELLO_SUFFIX);
                self.send(topic, envelope, DeliveryOptions::at_least_once())
                    .await;
                self.hello_sent = true;
            }
        }

        let filter = self.base.command_filter();
        match self.transport.subscribe(&filter, QoS::AtLeastOnce).await {
            Ok(()) => log::info!("Subscribed to {}", filter),
            Err(e) => log::error!("Failed to subscribe to '{}': {}", filter, e),
        }

        self.outbox.on_reconnected(Instant::now());
        self.outbox.flush(&self.transport).await;
    }

    pub async fn on_heartbeat(&mut self) {
        let envelope = Envelope::new(
            &self.location,
            json!({ "status": "online", "heartbeat": true }),
        );
        self.send(self.base.status_topic(), envelope, DeliveryOptions::retained())
            .await;
        self.outbox.flush_due(&self.transport, Instant::now()).await;
    }

    pub async fn on_flush_tick(&mut self, now: Instant) {
        self.outbox.flush_due(&self.transport, now).await;
    }

    /// The event loop wrote the publish with `pkid` to the connection.
    pub async fn on_publish_written(&mut self, pkid: u16) {
        if self.outbox.on_written(pkid).await {
            self.outbox.flush_due(&self.transport, Instant::now()).await;
        }
    }

    /// The broker acknowledged `pkid` (PUBACK, or PUBCOMP at QoS 2). When that was
    /// the queue head, the next message goes out.
    pub async fn on_publish_acked(&mut self, pkid: u16) {
        if self.outbox.on_acked(pkid).await {
            self.outbox.flush_due(&self.transport, Instant::now()).await;
        }
    }

    /// Handles a publish on `<base>/cmd/<route>`; anything else is ignored.
    pub async fn on_message(&mut self, topic: &str, payload: &[u8]) {
        let route = match self.base.command_route(topic) {
            Some(route) => route.to_string(),
            None => {
                log::debug!("Ignoring message on '{}'", topic);
                return;
            }
        };
        let ack_topic = self.base.topic_for(Channel::Ack, &route);
        let evt_topic = self.base.topic_for(Channel::Evt, &route);

        match parse_command(payload) {
            Command::Malformed => {
                log::warn!("Command on '{}' is not valid JSON", topic);
                let ack = Envelope::new(&self.location, ack_data(AckStatus::Error, Some(INVALID_JSON)))
                    .with_corr(None);
                self.send(ack_topic, ack, DeliveryOptions::at_least_once())
                    .await;
            }
            Command::Anonymous(_) => {
                log::info!("Executing command without id on '{}'", route);
                let ack = Envelope::new(&self.location, ack_data(AckStatus::Ok, None)).with_corr(None);
                self.send(ack_topic, ack, DeliveryOptions::at_least_once())
                    .await;
                self.send_execution(evt_topic, &route, None).await;
            }
            Command::Identified { id, .. } => {
                if !self.dedup.check_and_insert(&id, Utc::now()).await {
                    log::info!("Duplicate command {} on '{}'", id, route);
                    let ack = Envelope::new(&self.location, ack_data(AckStatus::Duplicate, None))
                        .with_corr(Some(&id));
                    self.send(ack_topic, ack, DeliveryOptions::at_least_once())
                        .await;
                    return;
                }

                log::info!("Executing command {} on '{}'", id, route);
                let ack = Envelope::new(&self.location, ack_data(AckStatus::Ok, None))
                    .with_corr(Some(&id));
                self.send(ack_topic, ack, DeliveryOptions::at_least_once())
                    .await;
                self.send_execution(evt_topic, &route, Some(&id)).await;
            }
        }
    }

    /// Publishes the retained offline status directly, bypassing the queue.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        let envelope = Envelope::new(&self.location, json!({ "status": "offline" }));
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let options = DeliveryOptions::retained();

        self.transport
            .publish(&self.base.status_topic(), &payload, options)
            .await?;
        log::info!("Gateway {} announced offline", self.base);
        Ok(())
    }

    async fn send_execution(&mut self, topic: String, route: &str, corr: Option<&str>) {
        let mut envelope = Envelope::new(&self.location, execution_data(route));
        if corr.is_some() {
            envelope = envelope.with_corr(corr);
        }
        self.send(topic, envelope, DeliveryOptions::at_least_once())
            .await;
    }

    async fn send(&mut self, topic: String, envelope: Envelope, options: DeliveryOptions) {
        match OutboxMessage::new(topic, &envelope, options) {
            Ok(message) => {
                self.outbox.enqueue_or_send(&self.transport, message).await;
            }
            Err(e) => log::error!("Failed to encode envelope {}: {}", envelope.id_str(), e),
        }
    }
}
