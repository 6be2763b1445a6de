pub mod config;
pub mod gateway;
pub mod sink;

pub use config::CollectorConfig;
