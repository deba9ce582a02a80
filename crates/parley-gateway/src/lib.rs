//! WebSocket bridge between clients and the fan-out topics.

pub mod connection;
