pub mod auth;
pub mod errors;
pub mod ids;
pub mod messages;

pub use auth::{Principal, PrincipalResolver, StaticTokenResolver};
pub use errors::HubError;
pub use ids::{ConnectionId, InstanceId};
pub use messages::{AuthRequest, InboundFrame, OutboundMessage, RelayEnvelope, Target};
