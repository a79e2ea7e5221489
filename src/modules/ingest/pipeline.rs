use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use super::device_state::DeviceStates;
use super::event_log::EventLog;
use super::provisioning::ProvisioningTokens;
use super::registry::{GatewayRegistry, RegistrationPolicy};
use crate::modules::mqtt::envelope::{decode_envelope, decode_sys_status, Envelope, StatusReport};
use crate::modules::mqtt::topic::{parse_topic, Address, Channel};
use crate::shared::db::models::{Event, Gateway, GatewayStatus, RecordOutcome};
use crate::shared::db::store::IngestStore;
use crate::shared::errors::{EnvelopeError, IngestError};

const HELLO_SUBPATH: &str = "system/hello";
const DEFAULT_STATE_KEY: &str = "state";

/// Side effects of one accepted message.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub address: Address,
    pub gateway_db_id: String,
    pub event_id: String,
    pub event: RecordOutcome,
    /// Set for sys/status messages.
    pub status: Option<GatewayStatus>,
    /// Set for state messages.
    pub state_key: Option<String>,
    /// Set when a hello carried a token: whether this message spent it.
    pub token_consumed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Valid topic on a channel the server does not ingest (cmd).
    Ignored(Address),
    Accepted(Accepted),
}

enum Payload {
    Status(StatusReport),
    Envelope(Envelope),
}

pub struct Pipeline {
    registry: GatewayRegistry,
    events: EventLog,
    states: DeviceStates,
    tokens: ProvisioningTokens,
}

impl Pipeline {
    pub fn new<S>(store: Arc<S>, policy: RegistrationPolicy) -> Self
    where
        S: IngestStore + 'static,
    {
        Self::from_parts(
            GatewayRegistry::new(store.clone(), policy),
            EventLog::new(store.clone()),
            DeviceStates::new(store.clone()),
            ProvisioningTokens::new(store),
        )
    }

    pub fn from_parts(
        registry: GatewayRegistry,
        events: EventLog,
        states: DeviceStates,
        tokens: ProvisioningTokens,
    ) -> Self {
        Self {
            registry,
            events,
            states,
            tokens,
        }
    }

    /// Runs one inbound message through the pipeline and logs the result.
    /// Rejections never propagate: the caller moves on to the next message.
    pub async fn process(&self, topic: &str, payload: &[u8]) {
        match self.handle(topic, payload).await {
            Ok(Outcome::Accepted(accepted)) => {
                log::info!(
                    "ingested tenant={} building={} gateway={} channel={} event_id={}{}",
                    accepted.address.tenant,
                    accepted.address.building,
                    accepted.address.gateway,
                    accepted.address.channel,
                    accepted.event_id,
                    if accepted.event == RecordOutcome::Duplicate {
                        " (duplicate)"
                    } else {
                        ""
                    }
                );
            }
            Ok(Outcome::Ignored(address)) => {
                log::debug!("ignoring {} message on '{}'", address.channel, topic);
            }
            Err(e) => {
                log::warn!("rejected message on '{}': {}", topic, e);
            }
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Outcome, IngestError> {
        let address = parse_topic(topic)?;

        if address.channel == Channel::Cmd {
            return Ok(Outcome::Ignored(address));
        }

        // Decode before any store access so a malformed payload leaves no trace.
        let decoded = if address.is_sys_status() {
            Payload::Status(decode_sys_status(payload)?)
        } else {
            Payload::Envelope(decode_envelope(payload)?)
        };

        let received_at = Utc::now();
        let gateway = self
            .registry
            .resolve(
                &address.tenant,
                &address.building,
                &address.gateway,
                received_at,
            )
            .await?;

        match decoded {
            Payload::Status(report) => {
                self.route_status(address, topic, gateway, report, received_at)
                    .await
            }
            Payload::Envelope(envelope) => {
                self.route_envelope(address, topic, gateway, envelope, received_at)
                    .await
            }
        }
    }

    async fn route_status(
        &self,
        address: Address,
        topic: &str,
        gateway: Gateway,
        report: StatusReport,
        received_at: DateTime<Utc>,
    ) -> Result<Outcome, IngestError> {
        self.registry.set_status(&gateway, report.status).await?;

        let (event_id, ts, payload) = match &report.envelope {
            Some(envelope) => (
                envelope.id_str(),
                envelope_ts(envelope, received_at),
                envelope_value(envelope)?,
            ),
            None => (
                uuid::Uuid::new_v4().to_string(),
                received_at,
                json!({ "status": report.status.as_str() }),
            ),
        };

        let event = new_event(&gateway, &address, topic, &event_id, "status", ts, payload);
        let recorded = self.events.record(event).await?;

        Ok(Outcome::Accepted(Accepted {
            gateway_db_id: gateway.id,
            event_id,
            event: recorded,
            status: Some(report.status),
            state_key: None,
            token_consumed: None,
            address,
        }))
    }

    async fn route_envelope(
        &self,
        address: Address,
        topic: &str,
        gateway: Gateway,
        envelope: Envelope,
        received_at: DateTime<Utc>,
    ) -> Result<Outcome, IngestError> {
        let event_id = envelope.id_str();
        let ts = envelope_ts(&envelope, received_at);

        let state_key = if address.channel == Channel::State {
            let key = if address.subpath.is_empty() {
                DEFAULT_STATE_KEY
            } else {
                address.subpath.as_str()
            };
            self.states
                .set_state(&gateway, key, ts, envelope.data.clone())
                .await?;
            Some(key.to_string())
        } else {
            None
        };

        let event_type = state_key
            .clone()
            .unwrap_or_else(|| address.event_type().to_string());
        let event = new_event(
            &gateway,
            &address,
            topic,
            &event_id,
            &event_type,
            ts,
            envelope_value(&envelope)?,
        );
        let recorded = self.events.record(event).await?;

        let token_consumed = if address.channel == Channel::Evt && address.subpath == HELLO_SUBPATH
        {
            self.consume_hello_token(&gateway, &envelope, received_at)
                .await?
        } else {
            None
        };

        Ok(Outcome::Accepted(Accepted {
            gateway_db_id: gateway.id,
            event_id,
            event: recorded,
            status: None,
            state_key,
            token_consumed,
            address,
        }))
    }

    async fn consume_hello_token(
        &self,
        gateway: &Gateway,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, IngestError> {
        let token = match envelope.data.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(None),
        };

        let consumed = self
            .tokens
            .consume(&gateway.tenant_id, &gateway.building_id, token, now)
            .await?;
        if consumed {
            log::info!("provisioning token consumed by gateway {}", gateway.gateway_id);
        } else {
            log::warn!(
                "gateway {} presented an unusable provisioning token",
                gateway.gateway_id
            );
        }
        Ok(Some(consumed))
    }
}

fn new_event(
    gateway: &Gateway,
    address: &Address,
    topic: &str,
    event_id: &str,
    event_type: &str,
    ts: DateTime<Utc>,
    payload: Value,
) -> Event {
    Event {
        id: uuid::Uuid::new_v4().to_string(),
        event_id: event_id.to_string(),
        tenant_id: gateway.tenant_id.clone(),
        building_id: gateway.building_id.clone(),
        gateway_db_id: gateway.id.clone(),
        type_: event_type.to_string(),
        channel: address.channel,
        topic: topic.to_string(),
        ts,
        payload,
        created_at: Utc::now(),
    }
}

fn envelope_value(envelope: &Envelope) -> Result<Value, EnvelopeError> {
    serde_json::to_value(envelope).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))
}

/// Envelope `ts` as RFC 3339 text or epoch milliseconds; anything else falls back
/// to the arrival time.
fn envelope_ts(envelope: &Envelope, received_at: DateTime<Utc>) -> DateTime<Utc> {
    let parsed = match &envelope.ts {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };

    parsed.unwrap_or_else(|| {
        log::debug!(
            "unusable ts {} on envelope {}, using arrival time",
            envelope.ts,
            envelope.id_str()
        );
        received_at
    })
}
