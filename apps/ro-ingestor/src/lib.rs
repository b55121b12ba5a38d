pub mod alarms;
pub mod config;
pub mod device;
pub mod diagnosis;
pub mod ingest;
pub mod mqtt;
pub mod pipeline;
pub mod presence;
pub mod store;
pub mod telemetry;
