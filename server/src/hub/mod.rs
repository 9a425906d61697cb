//! Subscription Hub
//!
//! Owns live WebSocket connections for this process: authenticates them at
//! connect, authorizes channel subscriptions against the caller's tenant and
//! user, and delivers bus events to the connections that asked for them.
//!
//! Connection lifecycle: `Connecting → Authenticated → Active → Closing → Closed`.

mod access;
mod connection;
mod error;
mod handler;
mod protocol;
mod registry;
mod relay;
mod throttle;

pub use access::{
    check_routes, AccessDirectory, DenyAll, PgAccessDirectory, RouteCheck, StaticAccessDirectory,
};
pub use connection::{CloseReason, Connection, ConnectionState, SendOutcome};
pub use error::HubError;
pub use handler::{authenticate, ws_handler, WsQuery, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER};
pub use protocol::{event_frame, ClientFrame, ServerFrame, EVENT_FRAME_OVERHEAD};
pub use registry::SubscriptionHub;
pub use relay::{spawn_local_relay, spawn_redis_relay};
pub use throttle::ControlThrottle;
