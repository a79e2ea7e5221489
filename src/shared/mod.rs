pub mod config;
pub mod db;
pub mod errors;
pub mod retry;
pub mod signals;
