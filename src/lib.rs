pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod schedule;
pub mod sender;
pub mod server;
pub mod stats;
pub mod worker;
