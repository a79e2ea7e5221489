pub mod edge;
pub mod ingest;
pub mod mqtt;
