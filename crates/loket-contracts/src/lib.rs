use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Inbound webhook payload (WhatsApp Cloud API shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChange {
    pub value: ChangeValue,
    #[serde(default)]
    pub field: Option<String>,
}

/// One change notification. Exactly one of `messages` / `statuses` is
/// normally populated; a statuses-only value is a delivery receipt and is
/// acknowledged without processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub statuses: Vec<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookContact {
    #[serde(default)]
    pub wa_id: Option<String>,
    pub profile: ContactProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub image: Option<ImageBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBody {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub recipient_id: String,
}

// ---------------------------------------------------------------------------
// Customer directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Ai,
    LiveChat,
}

impl Default for ChatStatus {
    fn default() -> Self {
        ChatStatus::Ai
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerRecord {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    pub stamp_count: u32,
    #[serde(default)]
    pub chat_status: ChatStatus,
    #[serde(default)]
    pub thread_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Invoice reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: String,
    pub total: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceBatch {
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub customer_name: Option<String>,
}

/// Ledger row. `total` holds the parsed integer amount; once `claimed` the
/// row is immutable and later claims on the same id must be rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub total: i64,
    pub claimed: bool,
    pub claimed_by: String,
    pub claimed_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Success,
    HasBeenClaimed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimConflict {
    pub invoice_id: String,
    pub claimed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceOutcome {
    pub status: InvoiceStatus,
    #[serde(default)]
    pub processed_ids: Vec<String>,
    pub total_amount: i64,
    pub previous_stamps: Option<u32>,
    pub stamps_added: u32,
    pub current_stamps: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ClaimConflict>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Assistant orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageFile { image_file: ImageFileRef },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFileRef {
    pub file_id: String,
    pub detail: String,
}

/// Side-channel customer metadata passed along with every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub phone_number: String,
    pub customer_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantReply {
    pub thread_handle: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Closed set of actions the orchestrator may request during a run. Names
/// outside this set are rejected with a typed error, never looked up
/// dynamically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    GetStampLoyalty,
    EnableLiveChat,
    DisableLiveChat,
    ProcessInvoices,
}

impl ToolAction {
    pub fn from_name(name: &str) -> Option<ToolAction> {
        match name {
            "get_stamp_loyalty" => Some(ToolAction::GetStampLoyalty),
            "enable_live_chat" => Some(ToolAction::EnableLiveChat),
            "disable_live_chat" => Some(ToolAction::DisableLiveChat),
            "process_invoices" => Some(ToolAction::ProcessInvoices),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolAction::GetStampLoyalty => "get_stamp_loyalty",
            ToolAction::EnableLiveChat => "enable_live_chat",
            ToolAction::DisableLiveChat => "disable_live_chat",
            ToolAction::ProcessInvoices => "process_invoices",
        }
    }
}
