use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::errors::ConfigError;
use super::retry::RetryPolicy;
use crate::modules::ingest::registry::RegistrationPolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: RetryPolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            tls: false,
            publish_timeout_ms: default_publish_timeout_ms(),
            reconnect: RetryPolicy::default(),
        }
    }
}

impl MqttConfig {
    /// Applies a `mqtt://host:port` style url on top of the file settings.
    pub fn apply_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("mqtts://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("ssl://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("mqtt://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("tcp://") {
            (false, rest)
        } else {
            return Err(ConfigError::BrokerUrl(url.to_string()));
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::BrokerUrl(url.to_string()))?;
                (host, port)
            }
            None => (authority, if tls { 8883 } else { 1883 }),
        };

        if host.is_empty() {
            return Err(ConfigError::BrokerUrl(url.to_string()));
        }

        self.broker = host.to_string();
        self.port = port;
        self.tls = tls;
        Ok(())
    }
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u16 {
    30
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_mongo_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            uri: default_mongo_uri(),
            database: default_database(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Mongo
}

fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "rentio".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub registration: RegistrationPolicy,
    /// Capacity of the channel between the bus event loop and the pipeline worker.
    /// When it fills up the event loop stops polling (and stops sending keep-alives)
    /// until the worker catches up, so size it for the worst expected burst.
    #[serde(default = "default_ingest_buffer")]
    pub buffer: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            registration: RegistrationPolicy::default(),
            buffer: default_ingest_buffer(),
        }
    }
}

fn default_ingest_buffer() -> usize {
    1024
}

/// Server side (`rentio-core`) configuration file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Configs {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(skip)]
    config_path: PathBuf,
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mqtt: MqttConfig::default(),
            database: DatabaseConfig::default(),
            ingest: IngestConfig::default(),
            config_path: PathBuf::new(),
        }
    }
}

impl Configs {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut configs: Configs = toml::from_str(&read_config(path.as_ref())?)?;
        configs.config_path = path.as_ref().to_path_buf();
        Ok(configs)
    }

    /// Loads from `RENTIO_CONFIG` when set, otherwise starts from defaults.
    /// `MQTT_URL` and `MONGODB_URI` override the file.
    pub fn load() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let mut configs = match env.get("RENTIO_CONFIG") {
            Some(path) => Self::load_from_file(path)?,
            None => Configs::default(),
        };
        configs.apply_env(&env)?;
        Ok(configs)
    }

    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(url) = non_empty(env, &["MQTT_URL"]) {
            self.mqtt.apply_url(&url)?;
        }
        if let Some(uri) = non_empty(env, &["MONGODB_URI"]) {
            self.database.uri = uri;
        }
        if let Some(level) = non_empty(env, &["RUST_LOG"]) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EdgeConfig {
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub building: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub flush_retry: RetryPolicy,
    /// How long the queue head waits for the broker's ack before it is published again.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default)]
    pub provisioning_token: Option<String>,
    #[serde(default = "default_dedup_file")]
    pub dedup_file: PathBuf,
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            building: String::new(),
            gateway: String::new(),
            heartbeat_secs: default_heartbeat_secs(),
            queue_file: default_queue_file(),
            max_queue: default_max_queue(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_retry: RetryPolicy::default(),
            ack_timeout_ms: default_ack_timeout_ms(),
            provisioning_token: None,
            dedup_file: default_dedup_file(),
            dedup_max_entries: default_dedup_max_entries(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            agent_version: default_agent_version(),
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_queue_file() -> PathBuf {
    PathBuf::from("/data/queue.jsonl")
}

fn default_max_queue() -> usize {
    5000
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_file() -> PathBuf {
    PathBuf::from("/data/seen-commands.jsonl")
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_dedup_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_shutdown_timeout_ms() -> u64 {
    3_000
}

fn default_agent_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Edge side (`rentio-edge`) configuration file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EdgeConfigs {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
}

impl Default for EdgeConfigs {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mqtt: MqttConfig::default(),
            edge: EdgeConfig::default(),
        }
    }
}

impl EdgeConfigs {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&read_config(path.as_ref())?)?)
    }

    /// Loads from `EDGE_CONFIG` when set, then applies environment overrides
    /// and checks that the gateway location is complete.
    pub fn load() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let mut configs = match env.get("EDGE_CONFIG") {
            Some(path) => Self::load_from_file(path)?,
            None => EdgeConfigs::default(),
        };
        configs.apply_env(&env)?;

        let missing = configs.missing();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        Ok(configs)
    }

    /// `RENTIO_*` variables win over their `EDGE_RENTIO_*` aliases.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(tenant) = non_empty(env, &["RENTIO_TENANT", "EDGE_RENTIO_TENANT"]) {
            self.edge.tenant = tenant;
        }
        if let Some(building) = non_empty(env, &["RENTIO_BUILDING", "EDGE_RENTIO_BUILDING"]) {
            self.edge.building = building;
        }
        if let Some(gateway) = non_empty(env, &["RENTIO_GATEWAY", "EDGE_RENTIO_GATEWAY"]) {
            self.edge.gateway = gateway;
        }
        if let Some(url) = non_empty(env, &["MQTT_URL"]) {
            self.mqtt.apply_url(&url)?;
        }
        if let Some(username) = non_empty(env, &["MQTT_USERNAME"]) {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = non_empty(env, &["MQTT_PASSWORD"]) {
            self.mqtt.password = Some(password);
        }
        if let Some(secs) = positive_int(env, &["HEARTBEAT_SEC", "HEARTBEAT_SECONDS"]) {
            self.edge.heartbeat_secs = secs as u64;
        }
        if let Some(max) = positive_int(env, &["MAX_QUEUE", "EDGE_MAX_QUEUE"]) {
            self.edge.max_queue = max;
        }
        if let Some(file) = non_empty(env, &["EDGE_QUEUE_FILE"]) {
            self.edge.queue_file = PathBuf::from(file);
        }
        if let Some(file) = non_empty(env, &["EDGE_DEDUP_FILE"]) {
            self.edge.dedup_file = PathBuf::from(file);
        }
        if let Some(token) = non_empty(env, &["PROVISIONING_TOKEN"]) {
            self.edge.provisioning_token = Some(token);
        }
        if let Some(level) = non_empty(env, &["RUST_LOG"]) {
            self.log_level = level;
        }
        Ok(())
    }

    /// Names the location settings that are still empty.
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.edge.tenant.trim().is_empty() {
            missing.push("RENTIO_TENANT or EDGE_RENTIO_TENANT".to_string());
        }
        if self.edge.building.trim().is_empty() {
            missing.push("RENTIO_BUILDING or EDGE_RENTIO_BUILDING".to_string());
        }
        if self.edge.gateway.trim().is_empty() {
            missing.push("RENTIO_GATEWAY or EDGE_RENTIO_GATEWAY".to_string());
        }
        missing
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// First non-blank value among `keys`, trimmed.
fn non_empty(env: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// First key holding a positive integer; invalid values fall through to the next key.
fn positive_int(env: &HashMap<String, String>, keys: &[&str]) -> Option<usize> {
    keys.iter()
        .filter_map(|key| env.get(*key))
        .filter_map(|value| value.trim().parse::<usize>().ok())
        .find(|value| *value > 0)
}
