use thiserror::Error;

/// Topic grammar violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic")]
    InvalidTopic,

    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

/// Envelope decoding and validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("invalid envelope: object required")]
    ObjectRequired,

    #[error("invalid envelope: {0}")]
    MissingField(&'static str),

    #[error("invalid sys/status payload")]
    InvalidStatus,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Mongo Error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Bson Error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("gateway {tenant}/{building}/{gateway} is not registered")]
    NotRegistered {
        tenant: String,
        building: String,
        gateway: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything that can make the pipeline reject one inbound message.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected to broker")]
    Disconnected,

    #[error("publish to '{topic}' timed out")]
    Timeout { topic: String },

    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid broker url: {0}")]
    BrokerUrl(String),

    #[error("missing configuration: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("failed to encode last will: {0}")]
    LastWill(#[source] serde_json::Error),

    #[error("failed to read certificate '{path}': {source}")]
    Certificate {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
