pub mod backup_job;
pub mod backup_log;
pub mod client;
pub mod settings;
pub mod user;
