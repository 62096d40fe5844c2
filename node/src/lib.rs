pub mod config;
pub mod file_watch;
pub mod lock_coordinator;
pub mod membership;
pub mod nameserver;
pub mod ownership;
pub mod peer;
pub mod transfer;
