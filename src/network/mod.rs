//! Network module.
//!
//! Contains the Gateway (WebSocket listener), session resolution and the
//! per-connection read/write loop.

mod connection;
mod gateway;
mod session;

pub use gateway::{Gateway, GatewayContext};
pub use session::{QuerySessionResolver, Session, SessionResolver};
