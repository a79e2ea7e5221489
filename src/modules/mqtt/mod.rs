pub mod envelope;
pub mod mqtt_client;
pub mod topic;
