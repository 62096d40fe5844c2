pub mod data_packet;
pub mod discovery;
pub mod error;
pub mod event_queue;
pub mod logger;
pub mod result;
pub mod ring;
pub mod tcp_pool;
