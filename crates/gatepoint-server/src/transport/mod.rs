//! Socket transports used by the gateway points.

pub mod tcp;
