//! roomlink - real-time presence and event distribution for chat rooms.
//!
//! A fleet of instances accepts WebSocket connections, keeps a local index
//! of who is connected to which room, and exchanges room and user events
//! over a shared event bus so every instance can deliver to its own clients.

pub mod admission;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod network;
pub mod service;
pub mod tracker;
