//! Couples the supervisor and the bridge, feeds the session, and forwards
//! every component event to the host.

use std::sync::Arc;

use shared::subscription::Subscription;
use supervisor::{ProcessSupervisor, SupervisorEvent};
use tracing::{debug, info};

use crate::{
    bridge::{BridgeEvent, ConnectionBridge},
    session::{SessionEvent, SessionStore},
};

#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    Supervisor(SupervisorEvent),
    Bridge(BridgeEvent),
}

/// Receiver for forwarded events: a UI layer or a telemetry recorder.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: RouterEvent);
}

impl<F> EventSink for F
where
    F: Fn(RouterEvent) + Send + Sync + 'static,
{
    fn deliver(&self, event: RouterEvent) {
        self(event)
    }
}

/// Owns every subscription installed by [`EventRouter::wire`]. Dropping the
/// router detaches them as well.
#[must_use = "dropping the router detaches its subscriptions"]
pub struct EventRouter {
    subscriptions: Vec<Subscription>,
}

impl EventRouter {
    pub fn wire(
        supervisor: &ProcessSupervisor,
        bridge: &ConnectionBridge,
        session: Arc<SessionStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let lifecycle = {
            let bridge = bridge.clone();
            let sink = Arc::clone(&sink);
            supervisor.on_event(move |event| {
                match &event {
                    SupervisorEvent::Ready => {
                        info!("worker ready, opening channel");
                        bridge.connect();
                    }
                    SupervisorEvent::Exit(exit) if !exit.superseded => {
                        info!(pid = exit.pid, "worker exited, closing channel");
                        bridge.disconnect();
                    }
                    SupervisorEvent::Exit(exit) => {
                        debug!(pid = exit.pid, "ignoring exit of a replaced worker");
                    }
                    SupervisorEvent::Log(_) | SupervisorEvent::Error(_) => {}
                }
                sink.deliver(RouterEvent::Supervisor(event));
            })
        };

        Self {
            subscriptions: vec![lifecycle, forward_bridge(bridge, session, sink)],
        }
    }

    /// Attaches only the bridge side, for hosts talking to a worker they did
    /// not launch.
    pub fn wire_bridge(
        bridge: &ConnectionBridge,
        session: Arc<SessionStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            subscriptions: vec![forward_bridge(bridge, session, sink)],
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscriptions.iter().any(Subscription::is_attached)
    }

    /// Events skipped across all listeners because they lagged behind.
    pub fn dropped_events(&self) -> u64 {
        self.subscriptions.iter().map(Subscription::dropped_events).sum()
    }

    pub fn cleanup(mut self) {
        let dropped = self.dropped_events();
        for subscription in self.subscriptions.drain(..) {
            subscription.detach();
        }
        info!(dropped, "event router detached");
    }
}

fn forward_bridge(
    bridge: &ConnectionBridge,
    session: Arc<SessionStore>,
    sink: Arc<dyn EventSink>,
) -> Subscription {
    bridge.on_event(move |event| {
        if let Some(transition) = SessionEvent::from_bridge(&event) {
            session.dispatch(&transition);
        }
        sink.deliver(RouterEvent::Bridge(event));
    })
}
