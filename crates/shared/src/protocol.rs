use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Sale,
    Refund,
    Abort,
    Reconnect,
    Restart,
    Status,
}

/// Envelope written to the worker's duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
}

impl OutboundCommand {
    fn bare(command: CommandKind) -> Self {
        Self {
            command,
            amount: None,
            order_no: None,
        }
    }

    pub fn sale(amount: impl Into<String>) -> Self {
        Self {
            amount: Some(amount.into()),
            ..Self::bare(CommandKind::Sale)
        }
    }

    pub fn refund(amount: impl Into<String>, order_no: impl Into<String>) -> Self {
        Self {
            command: CommandKind::Refund,
            amount: Some(amount.into()),
            order_no: Some(order_no.into()),
        }
    }

    pub fn abort() -> Self {
        Self::bare(CommandKind::Abort)
    }

    pub fn reconnect() -> Self {
        Self::bare(CommandKind::Reconnect)
    }

    pub fn restart() -> Self {
        Self::bare(CommandKind::Restart)
    }

    pub fn status() -> Self {
        Self::bare(CommandKind::Status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Processing,
    Success,
    Error,
    StatusUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Transaction,
    Control,
    Status,
}

impl CommandType {
    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "transaction" => Some(Self::Transaction),
            "control" => Some(Self::Control),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// Broadcasts carry `"command_type": ""`; empty and unrecognized tags read as
/// absent instead of failing the whole envelope.
fn lenient_command_type<'de, D>(deserializer: D) -> Result<Option<CommandType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(CommandType::from_wire))
}

/// Payload of an inbound message. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(rename = "TransType", default, skip_serializing_if = "Option::is_none")]
    pub trans_type: Option<String>,
    #[serde(rename = "Amount", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(rename = "ApprovalNo", default, skip_serializing_if = "Option::is_none")]
    pub approval_no: Option<String>,
    #[serde(rename = "MerchantID", default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(rename = "OrderNo", default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
    #[serde(rename = "CardNo", default, skip_serializing_if = "Option::is_none")]
    pub card_no: Option<String>,
    #[serde(rename = "RespCode", default, skip_serializing_if = "Option::is_none")]
    pub resp_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Envelope broadcast by the worker: status updates and command responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        deserialize_with = "lenient_command_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_type: Option<CommandType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl InboundMessage {
    pub fn is_transaction(&self) -> bool {
        self.command_type == Some(CommandType::Transaction)
    }
}

/// Transaction outcome fields kept by the session for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    #[serde(rename = "TransType", default, skip_serializing_if = "Option::is_none")]
    pub trans_type: Option<String>,
    #[serde(rename = "Amount", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(rename = "ApprovalNo", default, skip_serializing_if = "Option::is_none")]
    pub approval_no: Option<String>,
    #[serde(rename = "OrderNo", default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
    #[serde(rename = "CardNo", default, skip_serializing_if = "Option::is_none")]
    pub card_no: Option<String>,
    #[serde(rename = "RespCode", default, skip_serializing_if = "Option::is_none")]
    pub resp_code: Option<String>,
}

impl From<&ResponseData> for TransactionResult {
    fn from(data: &ResponseData) -> Self {
        Self {
            trans_type: data.trans_type.clone(),
            amount: data.amount.clone(),
            approval_no: data.approval_no.clone(),
            order_no: data.order_no.clone(),
            card_no: data.card_no.clone(),
            resp_code: data.resp_code.clone(),
        }
    }
}
