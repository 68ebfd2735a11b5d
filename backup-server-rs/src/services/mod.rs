pub mod access_rights;
pub mod agent_engine;
pub mod backup_runner;
pub mod client_log;
pub mod client_queue;
pub mod report_mailer;
pub mod stats;
pub mod status_registry;
