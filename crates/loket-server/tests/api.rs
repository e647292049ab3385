use axum::body::Body;
use axum::http::{Request, StatusCode};
use loket_config::{Assistant, Config, Dedup, EventLog, Loyalty, Server, Sheets, WhatsApp};
use loket_contracts::API_VERSION;
use loket_server::{build_app, verify_event_chain};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tower::util::ServiceExt;

fn test_config() -> Config {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        sheets: Sheets {
            backend: "memory".to_string(),
            api_base: None,
            access_token: None,
            customer_sheet_id: None,
            invoice_sheet_id: None,
        },
        whatsapp: WhatsApp {
            outbound: "log".to_string(),
            api_base: "https://graph.facebook.com/v22.0".to_string(),
            phone_number_id: None,
            access_token: None,
            verify_token: "test-verify".to_string(),
        },
        assistant: Assistant {
            mode: "builtin".to_string(),
            api_base: None,
            api_key: None,
            assistant_id: None,
            poll_interval_ms: 10,
            run_timeout_ms: 5_000,
        },
        dedup: Dedup {
            capacity: 128,
            retention_minutes: 30,
            purge_interval_minutes: 5,
        },
        loyalty: Loyalty {
            stamp_threshold: 50_000,
            readback_attempts: 3,
            readback_delay_ms: 0,
        },
        event_log: EventLog {
            jsonl_path: std::env::temp_dir()
                .join(format!("loket-events-{nanos}.jsonl"))
                .to_string_lossy()
                .to_string(),
        },
    }
}

fn text_message_payload(message_id: &str, phone: &str, name: &str, body: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "entry-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "1234"},
                    "contacts": [{"wa_id": phone, "profile": {"name": name}}],
                    "messages": [{
                        "id": message_id,
                        "from": phone,
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": {"body": body}
                    }]
                }
            }]
        }]
    })
}

fn status_only_payload(recipient: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "entry-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "1234"},
                    "statuses": [{
                        "id": "wamid.status.1",
                        "status": "delivered",
                        "timestamp": "1700000000",
                        "recipient_id": recipient
                    }]
                }
            }]
        }]
    })
}

fn invoice_batch(phone: &str, name: &str, items: Value) -> Value {
    json!({
        "items": items,
        "phone": phone,
        "customer_name": name,
    })
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let response = app.oneshot(get("/v1/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn contracts_endpoint_lists_enabled_actions() {
    let app = build_app(test_config()).await.unwrap();
    let response = app.oneshot(get("/v1/contracts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["version"], API_VERSION);
    assert_eq!(
        payload["actions"]["enabled"],
        json!([
            "get_stamp_loyalty",
            "enable_live_chat",
            "disable_live_chat",
            "process_invoices"
        ])
    );
}

#[tokio::test]
async fn webhook_verification_echoes_challenge() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .clone()
        .oneshot(get(
            "/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=test-verify&hub.challenge=12345",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"12345");

    let response = app
        .oneshot(get(
            "/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn status_only_payload_is_acknowledged_without_writes() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &status_only_payload("628111000001"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "success");

    // No directory row was created for the recipient.
    let lookup = app
        .oneshot(get("/v1/loyalty/628111000001"))
        .await
        .unwrap();
    let payload = body_json(lookup).await;
    assert_eq!(payload["status"], "not_found");
}

#[tokio::test]
async fn first_contact_creates_customer_with_defaults() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.first", "628111000002", "Budi", "Halo"),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "success");

    let lookup = app.oneshot(get("/v1/loyalty/628111000002")).await.unwrap();
    let payload = body_json(lookup).await;
    assert_eq!(payload["status"], "success");
    assert_eq!(payload["data"]["nama"], "Budi");
    assert_eq!(payload["data"]["nomor_telepon"], "628111000002");
    assert_eq!(payload["data"]["jumlah_stamp"], 0);
}

#[tokio::test]
async fn duplicate_message_id_is_acknowledged_without_side_effects() {
    let app = build_app(test_config()).await.unwrap();
    let payload = text_message_payload("wamid.dup", "628111000003", "Sari", "Halo");

    let first = app
        .clone()
        .oneshot(post_json("/whatsapp/webhook", &payload))
        .await
        .unwrap();
    let first = body_json(first).await;
    assert_eq!(first["status"], "success");
    assert!(first.get("deduplicated").is_none());

    let second = app
        .oneshot(post_json("/whatsapp/webhook", &payload))
        .await
        .unwrap();
    let second = body_json(second).await;
    assert_eq!(second["status"], "success");
    assert_eq!(second["deduplicated"], true);
}

#[tokio::test]
async fn live_chat_holds_messages_and_sends_no_reply() {
    let cfg = test_config();
    let events_path = cfg.event_log.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();
    let phone = "628111000004";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.lc-1", phone, "Dewi", "Halo"),
        ))
        .await
        .unwrap();

    let enabled = app
        .clone()
        .oneshot(post_json("/v1/live-chat/enable", &json!({"phone": phone})))
        .await
        .unwrap();
    let enabled = body_json(enabled).await;
    assert_eq!(enabled["status"], "success");
    assert_eq!(
        enabled["message"],
        "Live Chat mode has been enabled. Your messages will now be handled by a human agent."
    );

    let held = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.lc-2", phone, "Dewi", "Ada orang?"),
        ))
        .await
        .unwrap();
    let held = body_json(held).await;
    assert_eq!(held["status"], "success");
    assert_eq!(held["handled_by"], "live_chat");

    // Exactly one outbound send: the reply to the first message.
    let log = std::fs::read_to_string(&events_path).unwrap();
    let sends = log
        .lines()
        .filter(|line| line.contains("\"action\":\"send_message\""))
        .count();
    assert_eq!(sends, 1);
    assert!(log.contains("\"reason\":\"live_chat\""));
}

#[tokio::test]
async fn disable_live_chat_is_idempotent_and_reports_not_found() {
    let app = build_app(test_config()).await.unwrap();
    let phone = "628111000005";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.dis-1", phone, "Andi", "Halo"),
        ))
        .await
        .unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/v1/live-chat/disable", &json!({"phone": phone})))
            .await
            .unwrap();
        let payload = body_json(response).await;
        assert_eq!(payload["status"], "success");
        assert_eq!(
            payload["message"],
            "Live Chat mode has been disabled. Your messages will now be handled by the AI assistant."
        );
    }

    let response = app
        .oneshot(post_json(
            "/v1/live-chat/disable",
            &json!({"phone": "628999999999"}),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "error");
    assert_eq!(
        payload["message"],
        "Failed to disable Live Chat mode. Customer not found."
    );
}

#[tokio::test]
async fn invoice_batch_accrues_stamps_from_parsed_totals() {
    let app = build_app(test_config()).await.unwrap();
    let phone = "628111000006";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.inv-1", phone, "Budi", "Halo"),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch(phone, "Budi", json!([{"id": "#INV-1", "total": "Rp155.500"}])),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "success");
    assert_eq!(payload["processed_ids"], json!(["INV-1"]));
    assert_eq!(payload["total_amount"], 155_500);
    assert_eq!(payload["previous_stamps"], 0);
    assert_eq!(payload["stamps_added"], 3);
    assert_eq!(payload["current_stamps"], 3);

    let lookup = app.oneshot(get(&format!("/v1/loyalty/{phone}"))).await.unwrap();
    let payload = body_json(lookup).await;
    assert_eq!(payload["data"]["jumlah_stamp"], 3);
}

#[tokio::test]
async fn reclaim_is_rejected_and_nothing_is_mutated() {
    let app = build_app(test_config()).await.unwrap();
    let phone = "628111000007";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.rc-1", phone, "Budi", "Halo"),
        ))
        .await
        .unwrap();

    let first = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch(phone, "Budi", json!([{"id": "INV-9", "total": "Rp100.000"}])),
        ))
        .await
        .unwrap();
    let first = body_json(first).await;
    assert_eq!(first["status"], "success");
    assert_eq!(first["stamps_added"], 2);

    // Re-claim by the same customer.
    let again = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch(phone, "Budi", json!([{"id": "#INV-9", "total": "Rp100.000"}])),
        ))
        .await
        .unwrap();
    let again = body_json(again).await;
    assert_eq!(again["status"], "has_been_claimed");
    assert_eq!(again["conflicts"][0]["invoice_id"], "INV-9");
    assert_eq!(
        again["conflicts"][0]["claimed_by"],
        format!("Budi ({phone})")
    );

    // Claim attempt from a different customer conflicts too, and neither
    // attempt changed any counts.
    let other = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch("628999999998", "Tono", json!([{"id": "INV-9", "total": "Rp100.000"}])),
        ))
        .await
        .unwrap();
    let other = body_json(other).await;
    assert_eq!(other["status"], "has_been_claimed");

    let lookup = app.oneshot(get(&format!("/v1/loyalty/{phone}"))).await.unwrap();
    let payload = body_json(lookup).await;
    assert_eq!(payload["data"]["jumlah_stamp"], 2);
}

#[tokio::test]
async fn empty_batches_and_missing_phones_are_rejected() {
    let app = build_app(test_config()).await.unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &json!({"items": [], "phone": "628111000008"}),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "error");

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &json!({"items": [{"id": "INV-1", "total": "Rp100.000"}], "phone": ""}),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "error");

    // Ids that normalize to nothing leave no processable items.
    let response = app
        .oneshot(post_json(
            "/v1/invoices",
            &json!({"items": [{"id": "  #  ", "total": "Rp100.000"}], "phone": "628111000008"}),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "error");
}

#[tokio::test]
async fn zero_and_unparsable_totals_are_skipped_not_errors() {
    let app = build_app(test_config()).await.unwrap();
    let phone = "628111000009";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.skip-1", phone, "Budi", "Halo"),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch(
                phone,
                "Budi",
                json!([
                    {"id": "INV-A", "total": "Rp49.000"},
                    {"id": "INV-B", "total": "gratis"},
                    {"id": "INV-C", "total": "Rp0"}
                ]),
            ),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "success");
    assert_eq!(payload["processed_ids"], json!(["INV-A"]));
    assert_eq!(payload["total_amount"], 49_000);
    assert_eq!(payload["stamps_added"], 0);
    assert_eq!(payload["previous_stamps"], 0);
    assert_eq!(payload["current_stamps"], 0);
}

#[tokio::test]
async fn accrual_for_unknown_phone_reports_not_registered() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(post_json(
            "/v1/invoices",
            &invoice_batch(
                "628999999997",
                "",
                json!([{"id": "INV-NEW", "total": "Rp100.000"}]),
            ),
        ))
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "error");
    assert_eq!(
        payload["message"],
        "Mohon maaf, nomor telepon tidak terdaftar dalam program stamp loyalti"
    );
}

#[tokio::test]
async fn concurrent_batches_for_one_phone_serialize_to_four_stamps() {
    let app = build_app(test_config()).await.unwrap();
    let phone = "628111000010";

    let _ = app
        .clone()
        .oneshot(post_json(
            "/whatsapp/webhook",
            &text_message_payload("wamid.cc-1", phone, "Budi", "Halo"),
        ))
        .await
        .unwrap();

    let left = app.clone().oneshot(post_json(
        "/v1/invoices",
        &invoice_batch(phone, "Budi", json!([{"id": "INV-X", "total": "Rp100.000"}])),
    ));
    let right = app.clone().oneshot(post_json(
        "/v1/invoices",
        &invoice_batch(phone, "Budi", json!([{"id": "INV-Y", "total": "Rp100.000"}])),
    ));
    let (left, right) = tokio::join!(left, right);
    let left = body_json(left.unwrap()).await;
    let right = body_json(right.unwrap()).await;
    assert_eq!(left["status"], "success");
    assert_eq!(right["status"], "success");

    let lookup = app.oneshot(get(&format!("/v1/loyalty/{phone}"))).await.unwrap();
    let payload = body_json(lookup).await;
    assert_eq!(payload["data"]["jumlah_stamp"], 4);
}

#[tokio::test]
async fn event_chain_verification_detects_tampering() {
    let cfg = test_config();
    let events_path = cfg.event_log.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();

    for recipient in ["628111000011", "628111000012"] {
        let _ = app
            .clone()
            .oneshot(post_json(
                "/whatsapp/webhook",
                &status_only_payload(recipient),
            ))
            .await
            .unwrap();
    }

    assert!(verify_event_chain(&events_path).is_ok());

    let mut lines: Vec<String> = std::fs::read_to_string(&events_path)
        .unwrap()
        .lines()
        .map(|line| line.to_string())
        .collect();
    let mut tampered: Value = serde_json::from_str(&lines[0]).unwrap();
    tampered["reason"] = Value::String("tampered".to_string());
    lines[0] = serde_json::to_string(&tampered).unwrap();
    std::fs::write(&events_path, format!("{}\n", lines.join("\n"))).unwrap();

    assert!(verify_event_chain(&events_path).is_err());
}
