pub mod config;
pub mod metered;
pub mod telemetry;
