//! gatepoint-server: TCP collector gateway.
//!
//! Hosts the gateway points (framed identity collector, name registration,
//! port relay, pub/sub bridge) on top of a shared event-driven TCP hub, and
//! wires them together from a TOML config.

pub mod config;
pub mod liveness;
pub mod points;
pub mod server;
pub mod transport;

pub use config::{PointKind, ServerConfig};
pub use server::GatewayServer;
