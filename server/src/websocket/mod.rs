//! WebSocket change feed.
//!
//! Devices connect, subscribe to collection keys and receive every accepted
//! write to those keys for their owner. Messages are the JSON types of
//! `ensemble_engine::wire`.

mod manager;

pub use manager::ConnectionManager;
