use serde_json::{json, Value};

/// An inbound command payload, classified by what can be used for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Not JSON at all.
    Malformed,
    /// JSON without a usable string `id`; executed but never deduplicated.
    Anonymous(Value),
    Identified { id: String, body: Value },
}

impl Command {
    pub fn id(&self) -> Option<&str> {
        match self {
            Command::Identified { id, .. } => Some(id),
            _ => None,
        }
    }
}

pub fn parse_command(payload: &[u8]) -> Command {
    let body: Value = match serde_json::from_slice(payload) {
        Ok(body) => body,
        Err(_) => return Command::Malformed,
    };

    match body.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Command::Identified {
            id: id.to_string(),
            body,
        },
        _ => Command::Anonymous(body),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    Duplicate,
    Error,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Ok => "ok",
            AckStatus::Duplicate => "duplicate",
            AckStatus::Error => "error",
        }
    }
}

pub const INVALID_JSON: &str = "invalid-json";

pub fn ack_data(status: AckStatus, error: Option<&str>) -> Value {
    match error {
        Some(error) => json!({ "status": status.as_str(), "error": error }),
        None => json!({ "status": status.as_str() }),
    }
}

pub fn execution_data(route: &str) -> Value {
    json!({ "executed": true, "route": route })
}
