//! Client side of the POS terminal: the channel to the worker, the
//! transaction session it drives, and the router that ties both to the
//! process supervisor.

pub mod bridge;
pub mod router;
pub mod session;

pub use bridge::{
    BridgeConfig, BridgeConfigError, BridgeEvent, ConnectionBridge, ConnectionPhase, SendError,
};
pub use router::{EventRouter, EventSink, RouterEvent};
pub use session::{PendingForm, SessionEvent, SessionStore, TransactionSession};
