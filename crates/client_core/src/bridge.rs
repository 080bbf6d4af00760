//! Resilient duplex channel to the worker's WebSocket endpoint.
//!
//! The bridge owns at most one channel task at a time. Each task is tagged with
//! a channel id; callbacks from a task whose id no longer matches the current
//! handle are ignored, which is how a replaced or manually closed channel is
//! detached from the bridge.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{
    error::{Fault, FaultKind},
    protocol::InboundMessage,
    subscription::{listen, Subscription},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use url::Url;

/// Events buffered per listener; a listener further behind skips the oldest.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8989/ws".into(),
            reconnect_delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeConfigError {
    #[error("invalid channel url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("channel url '{0}' must use ws:// or wss://")]
    UnsupportedScheme(String),
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<Url, BridgeConfigError> {
        let url = Url::parse(&self.url).map_err(|source| BridgeConfigError::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            _ => Err(BridgeConfigError::UnsupportedScheme(self.url.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionPhase {
    Closed,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
    Error(Fault),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("channel task is gone")]
    ChannelClosed,
}

impl SendError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::NotConnected => FaultKind::SendWhileClosed,
            Self::Serialize(_) | Self::ChannelClosed => FaultKind::TransportError,
        }
    }
}

struct ChannelHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    close: Option<oneshot::Sender<()>>,
}

impl ChannelHandle {
    /// Asks the channel task to close without reporting back.
    fn detach(mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

struct ConnectionState {
    phase: ConnectionPhase,
    channel: Option<ChannelHandle>,
    reconnect_timer: Option<JoinHandle<()>>,
    should_reconnect: bool,
    next_channel_id: u64,
}

impl ConnectionState {
    fn is_current(&self, id: u64) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.id == id)
    }

    fn clear_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    config: BridgeConfig,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<BridgeEvent>,
    span: Span,
}

#[derive(Clone)]
pub struct ConnectionBridge {
    inner: Arc<Inner>,
}

impl ConnectionBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_span(config, info_span!("bridge"))
    }

    pub fn with_span(config: BridgeConfig, span: Span) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState {
                    phase: ConnectionPhase::Closed,
                    channel: None,
                    reconnect_timer: None,
                    should_reconnect: false,
                    next_channel_id: 0,
                }),
                events,
                span,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Opens the channel unless one is already open or opening.
    pub fn connect(&self) {
        let _entered = self.inner.span.enter();
        self.inner.connect();
    }

    /// Serializes and queues `message` on the open channel.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), SendError> {
        let _entered = self.inner.span.enter();
        let result = self.inner.send(message);
        if let Err(err) = &result {
            match err {
                SendError::NotConnected => debug!("send skipped: not connected"),
                other => error!(%other, "failed to send message"),
            }
        }
        result
    }

    /// Closes the channel and stops the reconnect cycle until the next
    /// `connect()`.
    pub fn disconnect(&self) {
        let _entered = self.inner.span.enter();
        self.inner.disconnect();
    }

    /// Final teardown; equivalent to [`ConnectionBridge::disconnect`].
    pub fn destroy(&self) {
        self.disconnect();
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock_state().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    pub fn reconnect_pending(&self) -> bool {
        self.inner.lock_state().reconnect_timer.is_some()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(BridgeEvent) + Send + 'static,
    {
        listen("bridge", self.subscribe_events(), handler)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn connect(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.should_reconnect = true;
        self.open_channel(&mut state);
    }

    /// Timer path: the reconnect intent is checked under the same lock that
    /// moves the phase to `Connecting`, so a `disconnect()` that lands first
    /// always wins.
    fn reconnect_from_timer(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.reconnect_timer = None;
        if !state.should_reconnect {
            debug!("reconnect cancelled");
            return;
        }
        self.open_channel(&mut state);
    }

    fn open_channel(self: &Arc<Self>, state: &mut ConnectionState) {
        match state.phase {
            ConnectionPhase::Open => {
                debug!("already connected");
                return;
            }
            ConnectionPhase::Connecting => {
                debug!("connection already in progress");
                return;
            }
            ConnectionPhase::Closed | ConnectionPhase::Closing => {}
        }

        if let Some(stale) = state.channel.take() {
            stale.detach();
        }
        state.phase = ConnectionPhase::Connecting;
        state.next_channel_id += 1;
        let id = state.next_channel_id;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        state.channel = Some(ChannelHandle {
            id,
            outbound: outbound_tx,
            close: Some(close_tx),
        });
        info!(url = %self.config.url, channel = id, "connecting to worker");

        tokio::spawn(
            Arc::clone(self)
                .run_channel(id, outbound_rx, close_rx)
                .instrument(self.span.clone()),
        );
    }

    async fn run_channel(
        self: Arc<Self>,
        id: u64,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        mut close: oneshot::Receiver<()>,
    ) {
        let connected = tokio::select! {
            result = connect_async(self.config.url.as_str()) => result,
            _ = &mut close => return,
        };
        let stream = match connected {
            Ok((stream, _)) => stream,
            Err(err) => {
                self.on_transport_error(id, format!("failed to connect: {err}"));
                self.on_close(id);
                return;
            }
        };
        if !self.on_open(id) {
            return;
        }

        let (mut writer, mut reader) = stream.split();
        loop {
            tokio::select! {
                _ = &mut close => {
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                }
                queued = outbound.recv() => {
                    let Some(message) = queued else { break };
                    if let Err(err) = writer.send(message).await {
                        self.on_transport_error(id, format!("write failed: {err}"));
                        break;
                    }
                }
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.on_text(id, &text),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(channel = id, ?frame, "close frame received");
                        self.mark_closing(id);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.on_transport_error(id, format!("receive failed: {err}"));
                        break;
                    }
                    None => break,
                },
            }
        }
        self.on_close(id);
    }

    fn on_open(&self, id: u64) -> bool {
        {
            let mut state = self.lock_state();
            if !state.is_current(id) {
                return false;
            }
            state.phase = ConnectionPhase::Open;
            state.clear_reconnect_timer();
        }
        info!(channel = id, "channel connected");
        self.emit(BridgeEvent::Connected);
        true
    }

    fn on_text(&self, id: u64, text: &str) {
        if !self.lock_state().is_current(id) {
            return;
        }
        match parse_inbound(text) {
            Ok(message) => self.emit(BridgeEvent::Message(message)),
            Err(fault) => warn!(channel = id, %fault, "dropping malformed worker message"),
        }
    }

    fn mark_closing(&self, id: u64) {
        let mut state = self.lock_state();
        if state.is_current(id) {
            state.phase = ConnectionPhase::Closing;
        }
    }

    fn on_transport_error(&self, id: u64, message: String) {
        if !self.lock_state().is_current(id) {
            return;
        }
        error!(channel = id, %message, "channel transport error");
        self.emit(BridgeEvent::Error(Fault::new(FaultKind::TransportError, message)));
    }

    fn on_close(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.lock_state();
            if !state.is_current(id) {
                return;
            }
            state.channel = None;
            state.phase = ConnectionPhase::Closed;
        }
        info!(channel = id, "channel disconnected");
        self.emit(BridgeEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if !state.should_reconnect || state.reconnect_timer.is_some() {
            return;
        }
        let delay = self.config.reconnect_delay;
        debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let inner = Arc::clone(self);
        state.reconnect_timer = Some(tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                inner.reconnect_from_timer();
            }
            .instrument(self.span.clone()),
        ));
    }

    fn send<T: Serialize>(&self, message: &T) -> Result<(), SendError> {
        let state = self.lock_state();
        let channel = match (&state.phase, &state.channel) {
            (ConnectionPhase::Open, Some(channel)) => channel,
            _ => return Err(SendError::NotConnected),
        };
        let text = serde_json::to_string(message)?;
        channel
            .outbound
            .send(Message::Text(text))
            .map_err(|_| SendError::ChannelClosed)
    }

    fn disconnect(&self) {
        let was_active = {
            let mut state = self.lock_state();
            state.should_reconnect = false;
            state.clear_reconnect_timer();
            let detached = state.channel.take();
            let was_active = detached.is_some();
            if let Some(channel) = detached {
                state.phase = ConnectionPhase::Closing;
                channel.detach();
            }
            state.phase = ConnectionPhase::Closed;
            was_active
        };
        info!("channel disconnected (manual)");
        if was_active {
            self.emit(BridgeEvent::Disconnected);
        }
    }
}

/// Malformed frames become a `ChannelParseFailure` fault that is only logged.
fn parse_inbound(text: &str) -> Result<InboundMessage, Fault> {
    serde_json::from_str(text)
        .map_err(|err| Fault::new(FaultKind::ChannelParseFailure, err.to_string()))
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
