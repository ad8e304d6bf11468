//! gatepoint-core: shared library for the collector gateway.
//!
//! Provides the star-delimited frame codec, the [`GatewayPoint`] contract
//! every endpoint implements, and the binding topology that chains points
//! into pipelines.

pub mod binding;
pub mod codec;
pub mod error;
pub mod point;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items at crate root.
pub use binding::{bind_pair, Binding, Forwarded, MAX_FORWARD_HOPS};
pub use codec::{decode_frame, encode_frame, function, DecodeOutcome, Frame, Malformed};
pub use error::{GatewayError, GatewayResult};
pub use point::{ClientFilter, EventKind, GatewayPoint, PointEvent, PointEvents, PointFuture};

/// Render at most `limit` bytes of a payload as hex for log lines.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    if data.len() > limit {
        format!("{}..", hex::encode(shown))
    } else {
        hex::encode(shown)
    }
}
