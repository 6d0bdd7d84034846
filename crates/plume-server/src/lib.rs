//! plume - an MQTT 3.1/3.1.1 message broker.

pub mod auth;
pub mod config;
pub mod conn_handle;
pub mod connection;
pub mod engine;
pub mod inflight;
pub mod retained;
pub mod server;
pub mod session;
pub mod shared;
pub mod subscription;
pub mod sys_tree;
pub mod util;
pub mod worker;
pub mod write_buffer;
