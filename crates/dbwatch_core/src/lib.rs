pub mod chaos;
pub mod config;
pub mod domain;
pub mod error;
pub mod incidents;
pub mod jobs;
pub mod monitor;
pub mod remediation;
pub mod store;
