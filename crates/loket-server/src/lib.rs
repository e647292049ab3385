use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use loket_config::Config;
use loket_contracts::{
    AssistantReply, ChatStatus, ClaimConflict, ContentBlock, CustomerRecord, ImageFileRef,
    InvoiceBatch, InvoiceOutcome, InvoiceRecord, InvoiceStatus, ToolAction, TurnMetadata,
    WebhookPayload, API_VERSION,
};
use loket_kernel::{
    customer_from_row, customer_to_row, display_claimant, invoice_from_row, invoice_to_row,
    message_already_claimed, message_invoice_summary, message_not_registered,
    message_stamp_count_pending, metadata_block, normalize_invoice_id, normalize_phone,
    parse_claim_amount, stable_file_id, stable_thread_handle, stamps_for_total, DedupCache,
    ReadBack,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

const TAB_CUSTOMERS: &str = "customers";
const TAB_INVOICES: &str = "invoices";

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PHONE_LOCKS: usize = 4096;

const BUILTIN_REPLY: &str = "Terima kasih, pesan Anda sudah kami terima.";

const LIVE_CHAT_ENABLED_MSG: &str =
    "Live Chat mode has been enabled. Your messages will now be handled by a human agent.";
const LIVE_CHAT_DISABLED_MSG: &str =
    "Live Chat mode has been disabled. Your messages will now be handled by the AI assistant.";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg).await?;

    // Age-based purge runs independently of capacity pressure.
    {
        let dedup = Arc::clone(&state.dedup);
        let every = Duration::from_secs(state.cfg.dedup.purge_interval_minutes.max(1) * 60);
        tokio::spawn(async move {
            loop {
                sleep(every).await;
                let mut cache = dedup.lock().await;
                cache.purge(Utc::now());
            }
        });
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg).await?))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/whatsapp/webhook", get(verify_webhook).post(webhook))
        .route("/v1/invoices", post(invoices))
        .route("/v1/live-chat/enable", post(enable_live_chat))
        .route("/v1/live-chat/disable", post(disable_live_chat))
        .route("/v1/loyalty/{phone}", get(loyalty))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("{0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    sheets: Arc<SheetBackend>,
    dedup: Arc<Mutex<DedupCache>>,
    assistant: Arc<AssistantClient>,
    whatsapp: Arc<WhatsAppClient>,
    events: Arc<EventLog>,
    phone_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let events = Arc::new(EventLog::new(&cfg.event_log.jsonl_path).await?);
        let sheets = if cfg.sheets.backend == "http" {
            SheetBackend::Http(HttpSheet::from_config(&cfg)?)
        } else {
            SheetBackend::Memory(MemorySheet::default())
        };
        Ok(Self {
            dedup: Arc::new(Mutex::new(DedupCache::new(
                cfg.dedup.capacity,
                chrono::Duration::minutes(cfg.dedup.retention_minutes),
            ))),
            assistant: Arc::new(AssistantClient::from_config(&cfg)?),
            whatsapp: Arc::new(WhatsAppClient::from_config(&cfg, Arc::clone(&events))?),
            sheets: Arc::new(sheets),
            events,
            phone_locks: Arc::new(Mutex::new(HashMap::new())),
            cfg,
        })
    }

    /// Mutations for one phone number are serialized through this lock; the
    /// backing store has no transactions, so this is the only thing standing
    /// between two concurrent read-then-add accruals.
    async fn phone_lock(&self, phone: &str) -> Arc<Mutex<()>> {
        let mut locks = self.phone_locks.lock().await;
        if locks.len() >= MAX_PHONE_LOCKS && !locks.contains_key(phone) {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(phone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn process_webhook(&self, payload: WebhookPayload) -> Result<Value, ServiceError> {
        let value = payload
            .entry
            .into_iter()
            .next()
            .and_then(|entry| entry.changes.into_iter().next())
            .map(|change| change.value)
            .ok_or_else(|| ServiceError::Validation("webhook payload carries no change".into()))?;

        if value.messages.is_empty() {
            let reason = if value.statuses.is_empty() {
                "no_messages"
            } else {
                "status_callback"
            };
            self.events
                .append(EventRecord::new("-", "webhook", "acknowledged", reason))
                .await;
            return Ok(json!({"status": "success"}));
        }

        let first_id = value.messages[0].id.clone();
        let is_new = {
            let mut cache = self.dedup.lock().await;
            cache.offer(&first_id, Utc::now())
        };
        if !is_new {
            self.events
                .append(EventRecord::new(
                    &first_id,
                    "webhook",
                    "acknowledged",
                    "deduplicated",
                ))
                .await;
            return Ok(json!({"status": "success", "deduplicated": true}));
        }

        let phone = normalize_phone(&value.messages[0].from);
        let contact_name = value
            .contacts
            .first()
            .and_then(|contact| contact.profile.name.clone())
            .unwrap_or_default();

        let customer = {
            let lock = self.phone_lock(&phone).await;
            let _guard = lock.lock().await;
            match find_customer(&self.sheets, &phone).await? {
                Some((_, record)) => record,
                None => {
                    let record = CustomerRecord {
                        name: contact_name.clone(),
                        phone: phone.clone(),
                        email: None,
                        stamp_count: 0,
                        chat_status: ChatStatus::Ai,
                        thread_handle: None,
                    };
                    self.sheets
                        .append_row(TAB_CUSTOMERS, customer_to_row(&record))
                        .await?;
                    self.events
                        .append(EventRecord::new(
                            &phone,
                            "directory",
                            "created",
                            "first_contact",
                        ))
                        .await;
                    record
                }
            }
        };

        if customer.chat_status == ChatStatus::LiveChat {
            self.events
                .append(EventRecord::new(&phone, "webhook", "held", "live_chat"))
                .await;
            return Ok(json!({"status": "success", "handled_by": "live_chat"}));
        }

        let mut blocks = Vec::new();
        for message in &value.messages {
            match message.kind.as_str() {
                "text" => {
                    if let Some(text) = &message.text {
                        blocks.push(ContentBlock::Text {
                            text: text.body.clone(),
                        });
                    }
                }
                "image" => {
                    if let Some(image) = &message.image {
                        // The block is not constructible until the bytes have
                        // landed in the orchestrator's file store.
                        let bytes = self.whatsapp.download_media(&image.id).await?;
                        let file_id = self
                            .assistant
                            .upload_file(bytes, &format!("whatsapp_image_{}.jpg", image.id))
                            .await?;
                        blocks.push(ContentBlock::ImageFile {
                            image_file: ImageFileRef {
                                file_id,
                                detail: "high".to_string(),
                            },
                        });
                        if let Some(caption) = &image.caption {
                            blocks.push(ContentBlock::Text {
                                text: caption.clone(),
                            });
                        }
                    }
                }
                other => {
                    self.events
                        .append(EventRecord::new(
                            &message.id,
                            "webhook",
                            "skipped",
                            &format!("unsupported_type_{other}"),
                        ))
                        .await;
                }
            }
        }
        if blocks.is_empty() {
            self.events
                .append(EventRecord::new(
                    &first_id,
                    "webhook",
                    "acknowledged",
                    "no_content",
                ))
                .await;
            return Ok(json!({"status": "success"}));
        }

        let meta = TurnMetadata {
            phone_number: phone.clone(),
            customer_name: contact_name.clone(),
        };
        let reply = self
            .assistant
            .run_turn(self, customer.thread_handle.clone(), blocks, &meta)
            .await?;

        {
            let lock = self.phone_lock(&phone).await;
            let _guard = lock.lock().await;
            if let Some((row, mut record)) = find_customer(&self.sheets, &phone).await? {
                if !contact_name.trim().is_empty() {
                    record.name = contact_name.clone();
                }
                record.thread_handle = Some(reply.thread_handle.clone());
                self.sheets
                    .update_row(TAB_CUSTOMERS, row, customer_to_row(&record))
                    .await?;
            }
        }
        self.events
            .append(EventRecord::new(
                &phone,
                "directory",
                "updated",
                "thread_persisted",
            ))
            .await;

        match &reply.text {
            Some(text) => {
                self.whatsapp.send_message(&phone, text).await?;
            }
            None => {
                self.events
                    .append(EventRecord::new(&phone, "webhook", "completed", "no_reply"))
                    .await;
            }
        }
        Ok(json!({"status": "success"}))
    }

    async fn process_invoices(&self, batch: InvoiceBatch) -> Result<InvoiceOutcome, ServiceError> {
        let phone = normalize_phone(&batch.phone);
        if batch.items.is_empty() {
            return Err(ServiceError::Validation("invoice batch is empty".into()));
        }
        if phone.is_empty() {
            return Err(ServiceError::Validation("phone is required".into()));
        }
        let items: Vec<(String, String)> = batch
            .items
            .iter()
            .filter_map(|item| normalize_invoice_id(&item.id).map(|id| (id, item.total.clone())))
            .collect();
        if items.is_empty() {
            return Err(ServiceError::Validation(
                "no valid invoice ids in batch".into(),
            ));
        }

        let lock = self.phone_lock(&phone).await;
        let _guard = lock.lock().await;

        let rows = self.sheets.get_values(TAB_INVOICES).await?;
        let mut ledger: HashMap<String, (Option<usize>, InvoiceRecord)> = HashMap::new();
        for (index, row) in rows.iter().enumerate() {
            if let Some(record) = invoice_from_row(row) {
                ledger.insert(record.invoice_id.clone(), (Some(index), record));
            }
        }

        let mut conflicts = Vec::new();
        for (id, _) in &items {
            if let Some((_, record)) = ledger.get(id) {
                if record.claimed {
                    conflicts.push(ClaimConflict {
                        invoice_id: id.clone(),
                        claimed_by: record.claimed_by.clone(),
                    });
                }
            }
        }
        if !conflicts.is_empty() {
            self.events
                .append(EventRecord::new(
                    &phone,
                    "invoices",
                    "rejected",
                    "has_been_claimed",
                ))
                .await;
            let message = message_already_claimed(&conflicts);
            return Ok(InvoiceOutcome {
                status: InvoiceStatus::HasBeenClaimed,
                processed_ids: vec![],
                total_amount: 0,
                previous_stamps: None,
                stamps_added: 0,
                current_stamps: None,
                conflicts,
                message,
            });
        }

        let customer = find_customer(&self.sheets, &phone).await?;
        let claimant_name = batch
            .customer_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                customer
                    .as_ref()
                    .map(|(_, record)| record.name.clone())
                    .filter(|name| !name.trim().is_empty())
            })
            .unwrap_or_default();
        let claimant = display_claimant(&claimant_name, &phone);
        let claimed_at = Utc::now().to_rfc3339();

        let mut total_amount: i64 = 0;
        let mut processed_ids = Vec::new();
        for (id, total) in &items {
            let Some(amount) = parse_claim_amount(total) else {
                self.events
                    .append(EventRecord::new(id, "invoices", "skipped", "unparsable_total"))
                    .await;
                continue;
            };
            let existing = ledger
                .get(id)
                .map(|(index, record)| (record.claimed, *index));
            match existing {
                Some((true, _)) => {
                    // Same id twice in one batch; the first occurrence owns it.
                    self.events
                        .append(EventRecord::new(
                            id,
                            "invoices",
                            "skipped",
                            "duplicate_in_batch",
                        ))
                        .await;
                    continue;
                }
                Some((false, index)) => {
                    let Some(row) = ledger.get_mut(id).map(|(_, record)| {
                        record.claimed = true;
                        record.claimed_by = claimant.clone();
                        record.claimed_at = claimed_at.clone();
                        invoice_to_row(record)
                    }) else {
                        continue;
                    };
                    if let Some(row_index) = index {
                        self.sheets.update_row(TAB_INVOICES, row_index, row).await?;
                    }
                }
                None => {
                    let record = InvoiceRecord {
                        invoice_id: id.clone(),
                        total: amount,
                        claimed: true,
                        claimed_by: claimant.clone(),
                        claimed_at: claimed_at.clone(),
                    };
                    self.sheets
                        .append_row(TAB_INVOICES, invoice_to_row(&record))
                        .await?;
                    ledger.insert(id.clone(), (None, record));
                }
            }
            total_amount += amount;
            processed_ids.push(id.clone());
        }

        let stamps_added = stamps_for_total(total_amount, self.cfg.loyalty.stamp_threshold);
        let processed = processed_ids.len();

        if stamps_added == 0 {
            let count = match &customer {
                Some((_, record)) => record.stamp_count,
                None => 0,
            };
            self.events
                .append(EventRecord::new(&phone, "invoices", "ok", "no_stamps_added"))
                .await;
            return Ok(InvoiceOutcome {
                status: InvoiceStatus::Success,
                processed_ids,
                total_amount,
                previous_stamps: Some(count),
                stamps_added: 0,
                current_stamps: Some(count),
                conflicts: vec![],
                message: message_invoice_summary(processed, 0, count, count),
            });
        }

        match self.add_stamps_locked(&phone, stamps_added).await? {
            Accrual::Applied { previous, current } => {
                self.events
                    .append(EventRecord::new(&phone, "invoices", "ok", "stamps_accrued"))
                    .await;
                Ok(InvoiceOutcome {
                    status: InvoiceStatus::Success,
                    processed_ids,
                    total_amount,
                    previous_stamps: Some(previous),
                    stamps_added,
                    current_stamps: Some(current),
                    conflicts: vec![],
                    message: message_invoice_summary(processed, stamps_added, previous, current),
                })
            }
            Accrual::CountUnknown { previous } => {
                self.events
                    .append(EventRecord::new(
                        &phone,
                        "invoices",
                        "ok",
                        "stamp_count_unknown",
                    ))
                    .await;
                Ok(InvoiceOutcome {
                    status: InvoiceStatus::Success,
                    processed_ids,
                    total_amount,
                    previous_stamps: Some(previous),
                    stamps_added,
                    current_stamps: None,
                    conflicts: vec![],
                    message: message_stamp_count_pending(processed, stamps_added),
                })
            }
            Accrual::NotFound => {
                self.events
                    .append(EventRecord::new(
                        &phone,
                        "invoices",
                        "error",
                        "customer_not_found",
                    ))
                    .await;
                Ok(InvoiceOutcome {
                    status: InvoiceStatus::Error,
                    processed_ids,
                    total_amount,
                    previous_stamps: None,
                    stamps_added: 0,
                    current_stamps: None,
                    conflicts: vec![],
                    message: message_not_registered().to_string(),
                })
            }
        }
    }

    /// Caller must hold the phone lock.
    async fn add_stamps_locked(&self, phone: &str, delta: u32) -> Result<Accrual, ServiceError> {
        let Some((row, mut record)) = find_customer(&self.sheets, phone).await? else {
            return Ok(Accrual::NotFound);
        };
        let previous = record.stamp_count;
        let expected = previous + delta;
        record.stamp_count = expected;
        self.sheets
            .update_row(TAB_CUSTOMERS, row, customer_to_row(&record))
            .await?;

        let attempts = self.cfg.loyalty.readback_attempts;
        let delay = Duration::from_millis(self.cfg.loyalty.readback_delay_ms);
        let outcome = read_back(attempts, delay, || {
            let sheets = Arc::clone(&self.sheets);
            let phone = phone.to_string();
            async move {
                match find_customer(&sheets, &phone).await {
                    Ok(Some((_, fresh))) if fresh.stamp_count >= expected => {
                        Some(fresh.stamp_count)
                    }
                    _ => None,
                }
            }
        })
        .await;

        match outcome {
            ReadBack::Ready(current) => Ok(Accrual::Applied { previous, current }),
            ReadBack::TimedOut => Ok(Accrual::CountUnknown { previous }),
        }
    }

    async fn set_chat_status(&self, phone: &str, status: ChatStatus) -> Result<(), ServiceError> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(ServiceError::Validation("phone is required".into()));
        }
        let lock = self.phone_lock(&phone).await;
        let _guard = lock.lock().await;
        let Some((row, mut record)) = find_customer(&self.sheets, &phone).await? else {
            return Err(ServiceError::NotFound("Customer not found".into()));
        };
        record.chat_status = status;
        self.sheets
            .update_row(TAB_CUSTOMERS, row, customer_to_row(&record))
            .await?;
        self.events
            .append(EventRecord::new(
                &phone,
                "live_chat",
                "recorded",
                match status {
                    ChatStatus::LiveChat => "enabled",
                    ChatStatus::Ai => "disabled",
                },
            ))
            .await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Accrual {
    Applied { previous: u32, current: u32 },
    CountUnknown { previous: u32 },
    NotFound,
}

/// Bounded read-after-write verification against an eventually consistent
/// store. The probe reports `Some(value)` once the fresh value is visible.
async fn read_back<T, F, Fut>(attempts: usize, delay: Duration, mut probe: F) -> ReadBack<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        if let Some(value) = probe().await {
            return ReadBack::Ready(value);
        }
        if attempt + 1 < attempts && delay > Duration::ZERO {
            sleep(delay).await;
        }
    }
    ReadBack::TimedOut
}

async fn find_customer(
    sheets: &SheetBackend,
    phone: &str,
) -> Result<Option<(usize, CustomerRecord)>, ServiceError> {
    let rows = sheets.get_values(TAB_CUSTOMERS).await?;
    for (index, row) in rows.iter().enumerate() {
        if let Some(record) = customer_from_row(row) {
            if record.phone == phone {
                return Ok(Some((index, record)));
            }
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    Json(json!({
        "version": API_VERSION,
        "actions": {
            "enabled": [
                "get_stamp_loyalty",
                "enable_live_chat",
                "disable_live_chat",
                "process_invoices"
            ]
        },
        "inputs": {
            "webhook": ["messages", "statuses"],
            "invoices": ["items", "phone", "customer_name"]
        }
    }))
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode == Some("subscribe") && token == Some(state.cfg.whatsapp.verify_token.as_str()) {
        (StatusCode::OK, challenge)
    } else {
        (
            StatusCode::FORBIDDEN,
            "webhook verification failed".to_string(),
        )
    }
}

async fn webhook(State(state): State<AppState>, Json(payload): Json<WebhookPayload>) -> Json<Value> {
    match state.process_webhook(payload).await {
        Ok(ack) => Json(ack),
        Err(e) => Json(json!({"status": "error", "message": e.to_string()})),
    }
}

async fn invoices(
    State(state): State<AppState>,
    Json(batch): Json<InvoiceBatch>,
) -> Json<InvoiceOutcome> {
    match state.process_invoices(batch).await {
        Ok(outcome) => Json(outcome),
        Err(e) => Json(error_outcome(e.to_string())),
    }
}

fn error_outcome(message: String) -> InvoiceOutcome {
    InvoiceOutcome {
        status: InvoiceStatus::Error,
        processed_ids: vec![],
        total_amount: 0,
        previous_stamps: None,
        stamps_added: 0,
        current_stamps: None,
        conflicts: vec![],
        message,
    }
}

#[derive(Debug, Deserialize)]
struct PhoneInput {
    phone: String,
}

async fn enable_live_chat(
    State(state): State<AppState>,
    Json(input): Json<PhoneInput>,
) -> Json<Value> {
    let result = state.set_chat_status(&input.phone, ChatStatus::LiveChat).await;
    Json(chat_status_result(result, true))
}

async fn disable_live_chat(
    State(state): State<AppState>,
    Json(input): Json<PhoneInput>,
) -> Json<Value> {
    let result = state.set_chat_status(&input.phone, ChatStatus::Ai).await;
    Json(chat_status_result(result, false))
}

fn chat_status_result(result: Result<(), ServiceError>, enabling: bool) -> Value {
    match result {
        Ok(()) => json!({
            "status": "success",
            "message": if enabling { LIVE_CHAT_ENABLED_MSG } else { LIVE_CHAT_DISABLED_MSG },
        }),
        Err(ServiceError::NotFound(_)) => json!({
            "status": "error",
            "message": if enabling {
                "Failed to enable Live Chat mode. Customer not found."
            } else {
                "Failed to disable Live Chat mode. Customer not found."
            },
        }),
        Err(e) => json!({"status": "error", "message": format!("An error occurred: {e}")}),
    }
}

async fn loyalty(State(state): State<AppState>, Path(phone): Path<String>) -> Json<Value> {
    let phone = normalize_phone(&phone);
    Json(loyalty_view(&state, &phone).await)
}

async fn loyalty_view(state: &AppState, phone: &str) -> Value {
    match find_customer(&state.sheets, phone).await {
        Ok(Some((_, record))) => json!({
            "status": "success",
            "data": {
                "nama": record.name,
                "nomor_telepon": record.phone,
                "jumlah_stamp": record.stamp_count,
            }
        }),
        Ok(None) => json!({"status": "not_found", "message": message_not_registered()}),
        Err(e) => json!({"status": "error", "message": format!("Terjadi kesalahan: {e}")}),
    }
}

// ---------------------------------------------------------------------------
// Tool dispatch (static registry; unknown names are rejected upstream)
// ---------------------------------------------------------------------------

async fn execute_tool(
    state: &AppState,
    action: ToolAction,
    arguments: &Value,
) -> Result<Value, ServiceError> {
    match action {
        ToolAction::GetStampLoyalty => {
            let phone = tool_phone(arguments)?;
            Ok(loyalty_view(state, &phone).await)
        }
        ToolAction::EnableLiveChat => {
            let phone = tool_phone(arguments)?;
            let result = state.set_chat_status(&phone, ChatStatus::LiveChat).await;
            Ok(chat_status_result(result, true))
        }
        ToolAction::DisableLiveChat => {
            let phone = tool_phone(arguments)?;
            let result = state.set_chat_status(&phone, ChatStatus::Ai).await;
            Ok(chat_status_result(result, false))
        }
        ToolAction::ProcessInvoices => {
            let batch: InvoiceBatch = serde_json::from_value(arguments.clone())
                .map_err(|e| ServiceError::Parse(format!("invoice batch arguments: {e}")))?;
            match state.process_invoices(batch).await {
                Ok(outcome) => serde_json::to_value(&outcome)
                    .map_err(|e| ServiceError::Parse(e.to_string())),
                Err(e) => Ok(json!({"status": "error", "message": e.to_string()})),
            }
        }
    }
}

fn tool_phone(arguments: &Value) -> Result<String, ServiceError> {
    ["nomor_telepon", "phone_number", "phone"]
        .iter()
        .find_map(|key| arguments.get(*key).and_then(Value::as_str))
        .map(normalize_phone)
        .filter(|phone| !phone.is_empty())
        .ok_or_else(|| ServiceError::Validation("tool arguments carry no phone number".into()))
}

// ---------------------------------------------------------------------------
// Sheet backends
// ---------------------------------------------------------------------------

enum SheetBackend {
    Memory(MemorySheet),
    Http(HttpSheet),
}

#[derive(Default)]
struct MemorySheet {
    tabs: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

struct HttpSheet {
    client: Client,
    api_base: String,
    access_token: String,
    customer_sheet_id: String,
    invoice_sheet_id: String,
}

impl SheetBackend {
    async fn get_values(&self, tab: &str) -> Result<Vec<Vec<String>>, ServiceError> {
        match self {
            SheetBackend::Memory(store) => {
                let tabs = store.tabs.lock().await;
                Ok(tabs.get(tab).cloned().unwrap_or_default())
            }
            SheetBackend::Http(store) => store.get_values(tab).await,
        }
    }

    async fn append_row(&self, tab: &str, row: Vec<String>) -> Result<(), ServiceError> {
        match self {
            SheetBackend::Memory(store) => {
                let mut tabs = store.tabs.lock().await;
                tabs.entry(tab.to_string()).or_default().push(row);
                Ok(())
            }
            SheetBackend::Http(store) => store.append_row(tab, row).await,
        }
    }

    /// `index` is the zero-based data row (header rows are not part of the
    /// snapshot).
    async fn update_row(&self, tab: &str, index: usize, row: Vec<String>) -> Result<(), ServiceError> {
        match self {
            SheetBackend::Memory(store) => {
                let mut tabs = store.tabs.lock().await;
                let rows = tabs.entry(tab.to_string()).or_default();
                match rows.get_mut(index) {
                    Some(slot) => {
                        *slot = row;
                        Ok(())
                    }
                    None => Err(ServiceError::Upstream(format!(
                        "row {index} does not exist in {tab}"
                    ))),
                }
            }
            SheetBackend::Http(store) => store.update_row(tab, index, row).await,
        }
    }
}

impl HttpSheet {
    fn from_config(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: cfg
                .sheets
                .api_base
                .clone()
                .ok_or_else(|| "sheets.api_base is required for backend=http".to_string())?,
            access_token: cfg
                .sheets
                .access_token
                .clone()
                .ok_or_else(|| "sheets.access_token is required for backend=http".to_string())?,
            customer_sheet_id: cfg.sheets.customer_sheet_id.clone().ok_or_else(|| {
                "sheets.customer_sheet_id is required for backend=http".to_string()
            })?,
            invoice_sheet_id: cfg
                .sheets
                .invoice_sheet_id
                .clone()
                .ok_or_else(|| "sheets.invoice_sheet_id is required for backend=http".to_string())?,
        })
    }

    fn sheet_id(&self, tab: &str) -> &str {
        if tab == TAB_INVOICES {
            &self.invoice_sheet_id
        } else {
            &self.customer_sheet_id
        }
    }

    fn last_column(tab: &str) -> char {
        if tab == TAB_INVOICES {
            'E'
        } else {
            'F'
        }
    }

    fn data_range(tab: &str) -> String {
        format!("Sheet1!A2:{}", Self::last_column(tab))
    }

    fn row_range(tab: &str, index: usize) -> String {
        let line = index + 2; // data starts at sheet row 2
        format!("Sheet1!A{line}:{}{line}", Self::last_column(tab))
    }

    async fn get_values(&self, tab: &str) -> Result<Vec<Vec<String>>, ServiceError> {
        let url = format!(
            "{}/{}/values/{}",
            self.api_base,
            self.sheet_id(tab),
            Self::data_range(tab)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("sheet read failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "sheet read failed: {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Parse(format!("sheet read response: {e}")))?;

        let mut rows = Vec::new();
        if let Some(values) = body.get("values").and_then(Value::as_array) {
            for row in values {
                let cells = row
                    .as_array()
                    .map(|cells| cells.iter().map(cell_to_string).collect())
                    .unwrap_or_default();
                rows.push(cells);
            }
        }
        Ok(rows)
    }

    async fn append_row(&self, tab: &str, row: Vec<String>) -> Result<(), ServiceError> {
        let url = format!(
            "{}/{}/values/{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.api_base,
            self.sheet_id(tab),
            Self::data_range(tab)
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"values": [row]}))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("sheet append failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "sheet append failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn update_row(&self, tab: &str, index: usize, row: Vec<String>) -> Result<(), ServiceError> {
        let url = format!(
            "{}/{}/values/{}?valueInputOption=RAW",
            self.api_base,
            self.sheet_id(tab),
            Self::row_range(tab, index)
        );
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"values": [row]}))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("sheet update failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "sheet update failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Assistant orchestrator client
// ---------------------------------------------------------------------------

struct AssistantClient {
    mode: AssistantMode,
}

enum AssistantMode {
    Builtin,
    Remote(RemoteAssistant),
}

struct RemoteAssistant {
    client: Client,
    api_base: String,
    api_key: String,
    assistant_id: String,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl AssistantClient {
    fn from_config(cfg: &Config) -> Result<Self, String> {
        if cfg.assistant.mode != "remote" {
            return Ok(Self {
                mode: AssistantMode::Builtin,
            });
        }
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            mode: AssistantMode::Remote(RemoteAssistant {
                client,
                api_base: cfg
                    .assistant
                    .api_base
                    .clone()
                    .ok_or_else(|| "assistant.api_base is required for mode=remote".to_string())?,
                api_key: cfg
                    .assistant
                    .api_key
                    .clone()
                    .ok_or_else(|| "assistant.api_key is required for mode=remote".to_string())?,
                assistant_id: cfg.assistant.assistant_id.clone().ok_or_else(|| {
                    "assistant.assistant_id is required for mode=remote".to_string()
                })?,
                poll_interval: Duration::from_millis(cfg.assistant.poll_interval_ms.max(1)),
                run_timeout: Duration::from_millis(cfg.assistant.run_timeout_ms.max(1)),
            }),
        })
    }

    async fn upload_file(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ServiceError> {
        match &self.mode {
            AssistantMode::Builtin => Ok(stable_file_id(filename)),
            AssistantMode::Remote(remote) => remote.upload_file(bytes, filename).await,
        }
    }

    async fn run_turn(
        &self,
        state: &AppState,
        thread: Option<String>,
        blocks: Vec<ContentBlock>,
        meta: &TurnMetadata,
    ) -> Result<AssistantReply, ServiceError> {
        match &self.mode {
            AssistantMode::Builtin => Ok(AssistantReply {
                thread_handle: thread
                    .unwrap_or_else(|| stable_thread_handle(&meta.phone_number)),
                text: Some(BUILTIN_REPLY.to_string()),
            }),
            AssistantMode::Remote(remote) => remote.run_turn(state, thread, blocks, meta).await,
        }
    }
}

impl RemoteAssistant {
    async fn run_turn(
        &self,
        state: &AppState,
        thread: Option<String>,
        mut blocks: Vec<ContentBlock>,
        meta: &TurnMetadata,
    ) -> Result<AssistantReply, ServiceError> {
        blocks.push(metadata_block(meta));

        let thread_id = match thread {
            Some(id) => id,
            None => {
                let body = self.post("threads", json!({})).await?;
                body["id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ServiceError::Parse("thread create response has no id".into()))?
            }
        };

        self.post(
            &format!("threads/{thread_id}/messages"),
            json!({"role": "user", "content": blocks}),
        )
        .await?;

        let run = self
            .post(
                &format!("threads/{thread_id}/runs"),
                json!({"assistant_id": self.assistant_id}),
            )
            .await?;
        let run_id = run["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Parse("run create response has no id".into()))?;

        let deadline = Instant::now() + self.run_timeout;
        loop {
            if Instant::now() >= deadline {
                // Best effort: stop the stalled run before giving up.
                let _ = self
                    .post(&format!("threads/{thread_id}/runs/{run_id}/cancel"), json!({}))
                    .await;
                return Err(ServiceError::Upstream(
                    "assistant run deadline exceeded".to_string(),
                ));
            }

            let status = self
                .get(&format!("threads/{thread_id}/runs/{run_id}"))
                .await?;
            match status["status"].as_str().unwrap_or_default() {
                "requires_action" => {
                    let calls = status["required_action"]["submit_tool_outputs"]["tool_calls"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default();
                    let mut outputs = Vec::new();
                    for call in calls {
                        let call_id = call["id"].as_str().unwrap_or_default().to_string();
                        let name = call["function"]["name"].as_str().unwrap_or_default();
                        let action = ToolAction::from_name(name).ok_or_else(|| {
                            ServiceError::Validation(format!("unknown assistant action: {name}"))
                        })?;
                        let arguments: Value =
                            serde_json::from_str(call["function"]["arguments"].as_str().unwrap_or("{}"))
                                .map_err(|e| {
                                    ServiceError::Parse(format!("tool arguments: {e}"))
                                })?;
                        let output = execute_tool(state, action, &arguments).await?;
                        outputs.push(json!({"tool_call_id": call_id, "output": output.to_string()}));
                    }
                    self.post(
                        &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                        json!({"tool_outputs": outputs}),
                    )
                    .await?;
                }
                "completed" => break,
                "failed" | "expired" | "cancelled" => {
                    return Err(ServiceError::Upstream(format!(
                        "assistant run ended as {}",
                        status["status"].as_str().unwrap_or("unknown")
                    )));
                }
                _ => sleep(self.poll_interval).await,
            }
        }

        let listing = self
            .get(&format!("threads/{thread_id}/messages?order=desc&limit=10"))
            .await?;
        let text = listing["data"].as_array().and_then(|messages| {
            messages
                .iter()
                .find(|message| message["role"] == "assistant")
                .and_then(|message| message["content"].as_array())
                .and_then(|content| {
                    content
                        .iter()
                        .find_map(|block| block["text"]["value"].as_str().map(str::to_string))
                })
        });

        Ok(AssistantReply {
            thread_handle: thread_id,
            text,
        })
    }

    async fn upload_file(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ServiceError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/jpeg")
            .map_err(|e| ServiceError::Parse(format!("media mime: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("purpose", "vision");

        let url = format!("{}/files", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("file upload failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "file upload failed: {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Parse(format!("file upload response: {e}")))?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Parse("file upload response has no id".into()))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ServiceError> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("assistant request failed: {e}")))?;
        Self::into_json(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, ServiceError> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("assistant request failed: {e}")))?;
        Self::into_json(response).await
    }

    async fn into_json(response: reqwest::Response) -> Result<Value, ServiceError> {
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "assistant request failed: {status}: {text}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::Parse(format!("assistant response: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Outbound WhatsApp client
// ---------------------------------------------------------------------------

struct WhatsAppClient {
    outbound_log_only: bool,
    client: Client,
    api_base: String,
    phone_number_id: String,
    access_token: String,
    events: Arc<EventLog>,
}

impl WhatsAppClient {
    fn from_config(cfg: &Config, events: Arc<EventLog>) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            outbound_log_only: cfg.whatsapp.outbound == "log",
            client,
            api_base: cfg.whatsapp.api_base.clone(),
            phone_number_id: cfg.whatsapp.phone_number_id.clone().unwrap_or_default(),
            access_token: cfg.whatsapp.access_token.clone().unwrap_or_default(),
            events,
        })
    }

    async fn send_message(&self, to: &str, body: &str) -> Result<(), ServiceError> {
        let recipient = normalize_phone(to);
        if self.outbound_log_only {
            self.events
                .append(EventRecord::new(
                    &recipient,
                    "send_message",
                    "logged",
                    "outbound_log_mode",
                ))
                .await;
            return Ok(());
        }

        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient,
            "type": "text",
            "text": {"preview_url": true, "body": body},
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("whatsapp send failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "whatsapp send failed: {status}: {text}"
            )));
        }
        self.events
            .append(EventRecord::new(&recipient, "send_message", "sent", "graph"))
            .await;
        Ok(())
    }

    async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, ServiceError> {
        if self.access_token.trim().is_empty() {
            return Err(ServiceError::NotConfigured(
                "whatsapp.access_token is required to download media".to_string(),
            ));
        }
        let url = format!("{}/{}", self.api_base, media_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("media lookup failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "media lookup failed: {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Parse(format!("media lookup response: {e}")))?;
        let media_url = body["url"]
            .as_str()
            .ok_or_else(|| ServiceError::Parse("media lookup response has no url".into()))?;

        let media = self
            .client
            .get(media_url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("media download failed: {e}")))?;
        if !media.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "media download failed: {}",
                media.status()
            )));
        }
        let bytes = media
            .bytes()
            .await
            .map_err(|e| ServiceError::Upstream(format!("media download failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Event log (hash-chained JSONL)
// ---------------------------------------------------------------------------

struct EventLog {
    file: Mutex<tokio::fs::File>,
    last_hash: Mutex<Option<String>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct EventRecord {
    record_id: String,
    correlation_id: String,
    action: String,
    result: String,
    reason: String,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl EventRecord {
    fn new(correlation_id: &str, action: &str, result: &str, reason: &str) -> Self {
        Self {
            record_id: format!("evt_{}", uuid::Uuid::new_v4().as_simple()),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason: reason.to_string(),
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }
}

impl EventLog {
    async fn new(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Mutex::new(file),
            last_hash: Mutex::new(last_hash),
        })
    }

    async fn append(&self, mut rec: EventRecord) {
        let prev_hash = { self.last_hash.lock().await.clone() };
        rec.prev_hash = prev_hash;
        if let Ok(seed) = serde_json::to_string(&rec) {
            rec.record_hash = hash_hex(seed.as_bytes());
        }

        let mut file = self.file.lock().await;
        if let Ok(line) = serde_json::to_string(&rec) {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;

            let mut last_hash = self.last_hash.lock().await;
            *last_hash = Some(rec.record_hash.clone());
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn verify_event_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: EventRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("event chain verified: {count} records"))
}
