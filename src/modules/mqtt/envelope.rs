use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::topic::Location;
use crate::shared::db::models::GatewayStatus;
use crate::shared::errors::EnvelopeError;

pub const PROTOCOL_VERSION: &str = "1";
pub const EDGE_SOURCE: &str = "edge-agent";

/// Required envelope fields, in the order they are checked.
pub const REQUIRED_FIELDS: [&str; 7] = ["v", "id", "ts", "tenant", "building", "gateway", "data"];

/// Message envelope exchanged on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: Value,
    pub id: Value,
    pub ts: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Value>,
    pub tenant: Value,
    pub building: Value,
    pub gateway: Value,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<Value>,
    /// Unknown fields travel along untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Fresh outgoing envelope for `location`.
    pub fn new(location: &Location, data: Value) -> Self {
        Envelope {
            v: Value::from(PROTOCOL_VERSION),
            id: Value::from(uuid::Uuid::new_v4().to_string()),
            ts: Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            src: Some(Value::from(EDGE_SOURCE)),
            tenant: Value::from(location.tenant.as_str()),
            building: Value::from(location.building.as_str()),
            gateway: Value::from(location.gateway.as_str()),
            data,
            corr: None,
            extra: Map::new(),
        }
    }

    pub fn with_corr(mut self, corr: Option<&str>) -> Self {
        self.corr = Some(corr.map(Value::from).unwrap_or(Value::Null));
        self
    }

    /// The id as text; string ids are used verbatim, anything else is rendered as JSON.
    pub fn id_str(&self) -> String {
        value_text(&self.id)
    }

    pub fn ts_str(&self) -> String {
        value_text(&self.ts)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Checks that `value` is an object carrying every required field with a non-null value.
pub fn validate_envelope(value: Value) -> Result<Envelope, EnvelopeError> {
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(EnvelopeError::ObjectRequired),
    };

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingField(field)),
            Some(_) => {}
        }
    }

    serde_json::from_value(Value::Object(obj)).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))
}

/// Decodes raw bytes into a validated envelope.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
    validate_envelope(value)
}

/// Parses the bare `online`/`offline` form of a sys/status payload.
pub fn parse_sys_status(raw: &str) -> Result<GatewayStatus, EnvelopeError> {
    let trimmed = raw.trim();
    let unquoted = trimmed.strip_prefix('"').unwrap_or(trimmed);
    let unquoted = unquoted.strip_suffix('"').unwrap_or(unquoted);

    match unquoted.to_ascii_lowercase().as_str() {
        "online" => Ok(GatewayStatus::Online),
        "offline" => Ok(GatewayStatus::Offline),
        _ => Err(EnvelopeError::InvalidStatus),
    }
}

/// A decoded sys/status message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: GatewayStatus,
    /// Present when the status came wrapped in a full envelope.
    pub envelope: Option<Envelope>,
}

/// Decodes a sys/status payload: either a bare status literal, or an envelope whose
/// `data.status` is a status literal.
pub fn decode_sys_status(payload: &[u8]) -> Result<StatusReport, EnvelopeError> {
    let text = std::str::from_utf8(payload).map_err(|_| EnvelopeError::InvalidStatus)?;

    if let Ok(status) = parse_sys_status(text) {
        return Ok(StatusReport {
            status,
            envelope: None,
        });
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => {
            let envelope = validate_envelope(value)?;
            let status = envelope
                .data
                .get("status")
                .and_then(Value::as_str)
                .ok_or(EnvelopeError::InvalidStatus)
                .and_then(parse_sys_status)?;
            Ok(StatusReport {
                status,
                envelope: Some(envelope),
            })
        }
        _ => Err(EnvelopeError::InvalidStatus),
    }
}
