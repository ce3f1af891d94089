pub mod aggregator;
pub mod client;
pub mod config;
pub mod config_validation;
pub mod errors;
pub mod executor;
pub mod extractor;
pub mod metrics;
pub mod percentiles;
pub mod prober;
pub mod prompts;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod template;
pub mod utils;
