//! Gateway point implementations.

pub mod framed;
pub mod pubsub;
pub mod registration;
pub mod relay;

pub use framed::{FramedIdentityPoint, FramedOptions};
pub use pubsub::{PubSubClient, PubSubMessage, PubSubPoint};
pub use registration::NameRegistrationPoint;
pub use relay::PortRelayPoint;
