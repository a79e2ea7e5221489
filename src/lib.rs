pub mod logger;
pub mod modules;
pub mod shared;
