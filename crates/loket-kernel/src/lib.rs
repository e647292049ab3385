use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use loket_contracts::{
    ChatStatus, ClaimConflict, ContentBlock, CustomerRecord, InvoiceRecord, TurnMetadata,
};
use serde_json::json;
use sha2::{Digest, Sha256};

pub const CUSTOMER_COLUMNS: usize = 6;
pub const INVOICE_COLUMNS: usize = 5;

const LIVE_CHAT_CELL: &str = "Live Chat";

// ---------------------------------------------------------------------------
// Message deduplication cache
// ---------------------------------------------------------------------------

/// Bounded, time-ordered set of recently seen inbound message ids.
///
/// `offer` answers "is this id new within the retention window" and records
/// it. Capacity pressure evicts the least recently offered id; `purge` drops
/// entries older than the retention window regardless of pressure. The
/// recency queue holds ghosts for refreshed ids and skips them on pop.
pub struct DedupCache {
    capacity: usize,
    retention: Duration,
    entries: HashMap<String, SeenEntry>,
    order: VecDeque<(String, DateTime<Utc>)>,
}

#[derive(Clone, Copy)]
struct SeenEntry {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl DedupCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true exactly when `id` has not been seen within the retention
    /// window. Re-offering a seen id refreshes its eviction recency but does
    /// not change the verdict.
    pub fn offer(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self.entries.get_mut(id) {
            if now - entry.first_seen < self.retention {
                entry.last_seen = now;
                self.order.push_back((id.to_string(), now));
                return false;
            }
            // Outside the window: the old sighting no longer counts.
            entry.first_seen = now;
            entry.last_seen = now;
            self.order.push_back((id.to_string(), now));
            return true;
        }

        while self.entries.len() >= self.capacity {
            let Some((evicted, marker)) = self.order.pop_front() else {
                break;
            };
            let current = self
                .entries
                .get(&evicted)
                .map(|entry| entry.last_seen == marker)
                .unwrap_or(false);
            if current {
                self.entries.remove(&evicted);
            }
            // otherwise: ghost of a refreshed id
        }

        self.entries.insert(
            id.to_string(),
            SeenEntry {
                first_seen: now,
                last_seen: now,
            },
        );
        self.order.push_back((id.to_string(), now));
        true
    }

    /// Drops entries whose first sighting is older than the retention
    /// window. Returns the number of entries removed.
    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, entry| now - entry.first_seen < retention);
        loop {
            let stale = match self.order.front() {
                Some((id, marker)) => self
                    .entries
                    .get(id)
                    .map(|entry| entry.last_seen != *marker)
                    .unwrap_or(true),
                None => false,
            };
            if !stale {
                break;
            }
            self.order.pop_front();
        }
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Normalization and parsing
// ---------------------------------------------------------------------------

/// Strips a leading `+` the way the outbound WhatsApp API expects numbers.
pub fn normalize_phone(raw: &str) -> String {
    raw.trim().trim_start_matches('+').to_string()
}

/// Trims and strips a single leading `#`. Ids left empty are dropped.
pub fn normalize_invoice_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('#').unwrap_or(trimmed).trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Parses a locale-formatted currency string ("Rp155.500", "Rp 1.250.000")
/// to its integer amount. `.` is a thousands separator; a `,` starts the
/// fractional part, which is dropped. Returns None for amounts that are
/// empty or zero, which the reconciliation engine skips.
pub fn parse_claim_amount(raw: &str) -> Option<i64> {
    let whole = raw.split(',').next().unwrap_or("");
    let digits: String = whole.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().filter(|amount| *amount > 0)
}

/// One stamp per full `threshold` of accumulated total.
pub fn stamps_for_total(total: i64, threshold: i64) -> u32 {
    if threshold <= 0 || total <= 0 {
        return 0;
    }
    (total / threshold) as u32
}

pub fn display_claimant(name: &str, phone: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        phone.to_string()
    } else {
        format!("{name} ({phone})")
    }
}

/// Deterministic thread handle for the builtin assistant mode.
pub fn stable_thread_handle(phone: &str) -> String {
    hash_id("thread", &[phone])
}

/// Deterministic file reference for the builtin assistant mode.
pub fn stable_file_id(filename: &str) -> String {
    hash_id("file", &[filename])
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

// ---------------------------------------------------------------------------
// Positional row codecs
// ---------------------------------------------------------------------------

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

pub fn chat_status_from_cell(raw: &str) -> ChatStatus {
    if raw.trim().eq_ignore_ascii_case(LIVE_CHAT_CELL) {
        ChatStatus::LiveChat
    } else {
        ChatStatus::Ai
    }
}

pub fn chat_status_to_cell(status: ChatStatus) -> &'static str {
    match status {
        ChatStatus::Ai => "",
        ChatStatus::LiveChat => LIVE_CHAT_CELL,
    }
}

/// `[name, phone, email, stamp_count, chat_status, thread_handle]`, phone
/// required. Malformed stamp counts read as zero; the store enforces no
/// schema of its own.
pub fn customer_from_row(row: &[String]) -> Option<CustomerRecord> {
    let phone = cell(row, 1).trim();
    if phone.is_empty() {
        return None;
    }
    let email = cell(row, 2).trim();
    let thread = cell(row, 5).trim();
    Some(CustomerRecord {
        name: cell(row, 0).trim().to_string(),
        phone: phone.to_string(),
        email: (!email.is_empty()).then(|| email.to_string()),
        stamp_count: cell(row, 3).trim().parse().unwrap_or(0),
        chat_status: chat_status_from_cell(cell(row, 4)),
        thread_handle: (!thread.is_empty()).then(|| thread.to_string()),
    })
}

pub fn customer_to_row(record: &CustomerRecord) -> Vec<String> {
    vec![
        record.name.clone(),
        record.phone.clone(),
        record.email.clone().unwrap_or_default(),
        record.stamp_count.to_string(),
        chat_status_to_cell(record.chat_status).to_string(),
        record.thread_handle.clone().unwrap_or_default(),
    ]
}

/// `[invoice_id, total, claimed, claimed_by, claimed_at]`.
pub fn invoice_from_row(row: &[String]) -> Option<InvoiceRecord> {
    let id = cell(row, 0).trim();
    if id.is_empty() {
        return None;
    }
    Some(InvoiceRecord {
        invoice_id: id.to_string(),
        total: cell(row, 1).trim().parse().unwrap_or(0),
        claimed: cell(row, 2).trim().eq_ignore_ascii_case("true"),
        claimed_by: cell(row, 3).trim().to_string(),
        claimed_at: cell(row, 4).trim().to_string(),
    })
}

pub fn invoice_to_row(record: &InvoiceRecord) -> Vec<String> {
    vec![
        record.invoice_id.clone(),
        record.total.to_string(),
        if record.claimed { "true" } else { "false" }.to_string(),
        record.claimed_by.clone(),
        record.claimed_at.clone(),
    ]
}

// ---------------------------------------------------------------------------
// Assistant turn content
// ---------------------------------------------------------------------------

/// Customer metadata rides along as a trailing text block so the
/// orchestrator sees it next to the actual message content.
pub fn metadata_block(meta: &TurnMetadata) -> ContentBlock {
    ContentBlock::Text {
        text: json!({
            "metadata": {
                "phone_number": meta.phone_number,
                "customer_name": meta.customer_name,
            }
        })
        .to_string(),
    }
}

// ---------------------------------------------------------------------------
// Read-after-write verification outcome
// ---------------------------------------------------------------------------

/// Result of a bounded read-back loop against an eventually consistent
/// store. `TimedOut` means the write went through but the fresh value never
/// became visible within the attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBack<T> {
    Ready(T),
    TimedOut,
}

// ---------------------------------------------------------------------------
// Customer-facing messages (Indonesian for business outcomes)
// ---------------------------------------------------------------------------

pub fn message_not_registered() -> &'static str {
    "Mohon maaf, nomor telepon tidak terdaftar dalam program stamp loyalti"
}

pub fn message_already_claimed(conflicts: &[ClaimConflict]) -> String {
    let listed = conflicts
        .iter()
        .map(|c| {
            if c.claimed_by.is_empty() {
                c.invoice_id.clone()
            } else {
                format!("{} (oleh {})", c.invoice_id, c.claimed_by)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("Mohon maaf, invoice berikut sudah pernah diklaim: {listed}")
}

pub fn message_invoice_summary(
    processed: usize,
    stamps_added: u32,
    previous: u32,
    current: u32,
) -> String {
    if stamps_added == 0 {
        return format!(
            "Terima kasih! {processed} invoice berhasil diproses. \
             Belum ada stamp baru, jumlah stamp Anda tetap {current}."
        );
    }
    format!(
        "Terima kasih! {processed} invoice berhasil diproses. \
         Anda mendapatkan {stamps_added} stamp baru (sebelumnya {previous}, sekarang {current})."
    )
}

pub fn message_stamp_count_pending(processed: usize, stamps_added: u32) -> String {
    format!(
        "Terima kasih! {processed} invoice berhasil diproses dan {stamps_added} stamp \
         telah ditambahkan. Jumlah stamp terbaru belum dapat dipastikan, \
         silakan cek kembali beberapa saat lagi."
    )
}
