//! UI-visible transaction state and its single reducer.

use serde::Serialize;
use shared::{
    domain::{AppState, FormTab, WorkerState},
    protocol::{InboundMessage, OutboundCommand, ResponseStatus, TransactionResult},
};
use tokio::sync::watch;

use crate::bridge::BridgeEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingForm {
    pub tab: FormTab,
    pub amount: String,
    pub order_no: String,
    pub refunding_order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSession {
    pub connected: bool,
    pub device_connected: bool,
    pub app_state: AppState,
    pub worker_state: WorkerState,
    pub message: String,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
    pub timeout_ms: Option<u64>,
    pub last_result: Option<TransactionResult>,
    pub form: PendingForm,
}

impl Default for TransactionSession {
    fn default() -> Self {
        Self {
            connected: false,
            device_connected: false,
            app_state: AppState::Disconnected,
            worker_state: WorkerState::Idle,
            message: String::new(),
            last_error: None,
            elapsed_ms: 0,
            timeout_ms: None,
            last_result: None,
            form: PendingForm::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    StatusUpdate {
        worker_state: WorkerState,
        message: String,
        elapsed_ms: u64,
        timeout_ms: Option<u64>,
        device_connected: bool,
    },
    TransactionStart,
    TransactionSuccess {
        result: TransactionResult,
    },
    TransactionError {
        error: String,
        result: Option<TransactionResult>,
    },
    TransactionTimeout,
    Dismiss,
    ResetForm,
    SetTab(FormTab),
    SetAmount(String),
    SetOrderNo(String),
    SetRefundingOrder {
        order_id: String,
        amount: String,
        order_no: String,
    },
}

impl SessionEvent {
    /// Translates a worker broadcast into a reducer event. Messages that do
    /// not affect the session yield `None`.
    pub fn from_inbound(message: &InboundMessage) -> Option<Self> {
        match message.status {
            ResponseStatus::StatusUpdate => {
                let data = message.data.as_ref()?;
                Some(Self::StatusUpdate {
                    worker_state: data
                        .state
                        .as_deref()
                        .map_or(WorkerState::Idle, WorkerState::parse_lenient),
                    message: message.message.clone(),
                    elapsed_ms: data.elapsed_ms.unwrap_or(0),
                    timeout_ms: data.timeout_ms,
                    device_connected: data.is_connected.unwrap_or(false),
                })
            }
            ResponseStatus::Success if message.is_transaction() => Some(Self::TransactionSuccess {
                result: message
                    .data
                    .as_ref()
                    .map(TransactionResult::from)
                    .unwrap_or_default(),
            }),
            ResponseStatus::Error if message.is_transaction() => Some(Self::TransactionError {
                error: message.message.clone(),
                result: message.data.as_ref().map(TransactionResult::from),
            }),
            _ => None,
        }
    }

    pub fn from_bridge(event: &BridgeEvent) -> Option<Self> {
        match event {
            BridgeEvent::Connected => Some(Self::Connected),
            BridgeEvent::Disconnected => Some(Self::Disconnected),
            BridgeEvent::Message(message) => Self::from_inbound(message),
            BridgeEvent::Error(_) => None,
        }
    }
}

impl TransactionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure transition: the same `(self, event)` pair always yields the same
    /// session.
    pub fn apply(&self, event: &SessionEvent) -> Self {
        let mut next = self.clone();
        match event {
            SessionEvent::Connected => {
                next.connected = true;
                next.app_state = AppState::Idle;
                next.message = "Connected to POS Server".into();
            }
            SessionEvent::Disconnected => {
                next.connected = false;
                next.app_state = AppState::Disconnected;
                next.worker_state = WorkerState::Idle;
                next.message = "Disconnected from POS Server".into();
            }
            SessionEvent::StatusUpdate {
                worker_state,
                message,
                elapsed_ms,
                timeout_ms,
                device_connected,
            } => {
                next.worker_state = *worker_state;
                next.app_state = AppState::from(*worker_state);
                next.message = message.clone();
                next.elapsed_ms = *elapsed_ms;
                next.timeout_ms = *timeout_ms;
                next.device_connected = *device_connected;
            }
            SessionEvent::TransactionStart => {
                next.app_state = AppState::Processing;
                next.message = "Starting transaction...".into();
                next.last_result = None;
                next.last_error = None;
            }
            SessionEvent::TransactionSuccess { result } => {
                next.app_state = AppState::Success;
                next.message = "Transaction approved".into();
                next.last_result = Some(result.clone());
                next.last_error = None;
            }
            SessionEvent::TransactionError { error, result } => {
                next.app_state = AppState::Error;
                next.message = error.clone();
                next.last_error = Some(error.clone());
                next.last_result = result.clone();
            }
            SessionEvent::TransactionTimeout => {
                next.app_state = AppState::Timeout;
                next.message = "Transaction timed out".into();
                next.last_error = Some("operation timed out".into());
            }
            SessionEvent::Dismiss => {
                next.app_state = if self.connected {
                    AppState::Idle
                } else {
                    AppState::Disconnected
                };
                next.message.clear();
                next.form.amount.clear();
                // A manually typed reference survives; one filled in for a refund does not.
                if self.form.refunding_order_id.is_some() {
                    next.form.order_no.clear();
                }
                next.form.refunding_order_id = None;
            }
            SessionEvent::ResetForm => next.form = PendingForm::default(),
            SessionEvent::SetTab(tab) => {
                next.form.tab = *tab;
                if *tab == FormTab::Sale {
                    next.form.order_no.clear();
                    next.form.refunding_order_id = None;
                }
            }
            SessionEvent::SetAmount(amount) => next.form.amount = amount.clone(),
            SessionEvent::SetOrderNo(order_no) => next.form.order_no = order_no.clone(),
            SessionEvent::SetRefundingOrder {
                order_id,
                amount,
                order_no,
            } => {
                next.form = PendingForm {
                    tab: FormTab::Refund,
                    amount: amount.clone(),
                    order_no: order_no.clone(),
                    refunding_order_id: Some(order_id.clone()),
                };
            }
        }
        next
    }

    pub fn can_submit(&self) -> bool {
        self.connected
            && self.device_connected
            && self.app_state == AppState::Idle
            && parse_amount(&self.form.amount) > 0
            && (self.form.tab != FormTab::Refund || !self.form.order_no.is_empty())
    }

    pub fn can_abort(&self) -> bool {
        self.app_state == AppState::Processing
    }

    pub fn can_input_form(&self) -> bool {
        self.app_state == AppState::Idle && self.connected
    }

    pub fn show_modal(&self) -> bool {
        matches!(
            self.app_state,
            AppState::Processing | AppState::Success | AppState::Error | AppState::Timeout
        )
    }

    /// The SALE or REFUND command for the current form, if it may be submitted.
    pub fn submit_command(&self) -> Option<OutboundCommand> {
        if !self.can_submit() {
            return None;
        }
        Some(match self.form.tab {
            FormTab::Sale => OutboundCommand::sale(self.form.amount.clone()),
            FormTab::Refund => {
                OutboundCommand::refund(self.form.amount.clone(), self.form.order_no.clone())
            }
        })
    }
}

/// Integer-prefix parse: leading digits after optional whitespace, anything
/// else counts as zero.
fn parse_amount(raw: &str) -> u64 {
    let trimmed = raw.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let digits = &trimmed[..end];
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or(u64::MAX)
}

/// Holds the live session and publishes every new value to watchers.
pub struct SessionStore {
    state: watch::Sender<TransactionSession>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TransactionSession::default());
        Self { state }
    }

    /// Applies `event` and returns the resulting session.
    pub fn dispatch(&self, event: &SessionEvent) -> TransactionSession {
        let mut applied = TransactionSession::default();
        self.state.send_modify(|session| {
            *session = session.apply(event);
            applied = session.clone();
        });
        applied
    }

    pub fn snapshot(&self) -> TransactionSession {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransactionSession> {
        self.state.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
