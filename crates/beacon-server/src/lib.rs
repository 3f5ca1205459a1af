pub mod connection;
pub mod handler;
pub mod hub;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod socket;

pub use connection::{Connection, ConnectionState};
pub use handler::{BroadcastHandler, DirectHandler, HandlerMap, MessageHandler};
pub use hub::{Hub, HubConfig, HubState};
pub use queue::OutboundQueue;
pub use registry::ConnectionRegistry;
pub use relay::{Relay, RelayState};
pub use router::BroadcastRouter;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
