pub mod events;
pub mod manager;
pub mod retry;
pub mod state;

pub use events::{EventBus, EventCallback, EventKind, EventRegistry, PeerEvent, ReconnectFailure, SubscriptionId};
pub use manager::{PeerConnectionManager, PeerOptions, PeerSnapshot, TransportEvent, TransportEvents};
pub use retry::RetryPolicy;
pub use state::{ConnectionState, ConnectionStateMachine};
