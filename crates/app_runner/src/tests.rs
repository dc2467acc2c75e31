use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use core_types::{Clock, LedgerEvent};
use infra_clock::ManualClock;
use ledger_store::LedgerStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::bootstrap::{build_state, AppState};
use crate::config_loader::{parse_engine_config, EngineConfig, OracleKind};
use crate::ledger_api::build_router;

const CONFIG: &str = r#"
[server]
bind = "127.0.0.1:0"

[oracle]
kind = "static"
timeout_ms = 200

[oracle.participants]
bitcoin = ["0xAlice", "0xBob"]
ethereum = ["0xAlice"]

[[markets]]
id = "bitcoin"
display = "Bitcoin Up/Down"

[[markets]]
id = "ethereum"
display = "Ethereum Up/Down"
"#;

fn tuesday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 4, 12, 0, 0).unwrap()
}

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
    state: AppState,
}

fn harness() -> Harness {
    let cfg = parse_engine_config(CONFIG).unwrap();
    let clock = Arc::new(ManualClock::new(tuesday_noon()));
    let prometheus = PrometheusBuilder::new().build_recorder().handle();
    let store = LedgerStore::open_in_memory().unwrap();
    let state = build_state(&cfg, store, clock.clone() as Arc<dyn Clock>, prometheus).unwrap();
    Harness {
        app: build_router(state.clone()),
        clock,
        state,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn bet(app: &Router, wallet: &str, market: &str, prediction: &str) -> (StatusCode, Value) {
    call(
        app,
        "POST",
        "/bets",
        Some(json!({ "wallet": wallet, "market": market, "prediction": prediction })),
    )
    .await
}

#[test]
fn config_parses_markets_and_participants() {
    let cfg = parse_engine_config(CONFIG).unwrap();
    assert_eq!(cfg.server.bind, "127.0.0.1:0");
    assert_eq!(cfg.server.event_bus_capacity, 1024);
    assert_eq!(cfg.oracle.kind, OracleKind::Static);
    assert_eq!(cfg.oracle.timeout().as_millis(), 200);
    assert_eq!(cfg.oracle.participants["bitcoin"].len(), 2);

    let registry = cfg.registry();
    assert_eq!(registry.len(), 2);
    assert!(registry.resolve("BITCOIN").is_ok());
    assert!(registry.resolve("featured").is_err());
}

#[test]
fn empty_config_uses_defaults() {
    let cfg = parse_engine_config("").unwrap();
    assert_eq!(cfg, EngineConfig::default());
    assert!(cfg.storage.path.is_none());
    assert!(cfg.registry().resolve("featured").is_ok());
}

#[test]
fn malformed_config_is_an_error() {
    assert!(parse_engine_config("[oracle]\nkind = \"carrier-pigeon\"").is_err());
}

#[test]
fn unknown_participant_market_fails_bootstrap() {
    let cfg = parse_engine_config("[oracle.participants]\ndogecoin = [\"0xabc\"]").unwrap();
    let prometheus = PrometheusBuilder::new().build_recorder().handle();
    let store = LedgerStore::open_in_memory().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(tuesday_noon()));
    assert!(build_state(&cfg, store, clock, prometheus).is_err());
}

#[tokio::test]
async fn health_and_phase() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["markets"], 2);

    let (_, body) = call(&h.app, "GET", "/phase", None).await;
    assert_eq!(body["phase"], "open");
    assert_eq!(body["target_date"], "2024-06-05");
    assert_eq!(body["entry_fee_micros"], 40_000);

    h.clock.advance(Duration::days(3));
    let (_, body) = call(&h.app, "GET", "/phase", None).await;
    assert_eq!(body["phase"], "results_pending");
    assert!(body["target_date"].is_null());
}

#[tokio::test]
async fn metrics_endpoint_renders_text() {
    let h = harness();
    let resp = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn participant_places_then_replaces_bet() {
    let h = harness();
    let (status, body) = bet(&h.app, "0xAlice", "bitcoin", "up").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replaced"], false);
    assert_eq!(body["bet"]["wallet"], "0xalice");
    assert_eq!(body["bet"]["target_date"], "2024-06-05");

    let (status, body) = bet(&h.app, "0xalice", "Bitcoin", "negative").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replaced"], true);
    assert_eq!(body["bet"]["prediction"], "down");

    let (status, view) = call(&h.app, "GET", "/bets/bitcoin/0xalice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "open");
    assert!(view["today_result"].is_null());
    assert_eq!(view["tomorrow_prediction"]["prediction"], "down");

    let (_, stored) = call(&h.app, "GET", "/bets/bitcoin/0xalice/2024-06-05", None).await;
    assert_eq!(stored["prediction"], "down");
    let (_, missing) = call(&h.app, "GET", "/bets/ethereum/0xalice/2024-06-05", None).await;
    assert!(missing.is_null());

    let (_, day) = call(&h.app, "GET", "/markets/bitcoin/bets/2024-06-05", None).await;
    assert_eq!(day.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rejections_map_to_status_codes() {
    let h = harness();
    let (status, body) = bet(&h.app, "0xcarol", "bitcoin", "up").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not_participant");
    assert_eq!(body["class"], "authorization");

    let (status, body) = bet(&h.app, "0xbob", "ethereum", "up").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not_participant");

    let (status, body) = bet(&h.app, "0xalice", "bitcoin", "sideways").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_prediction");

    let (status, body) = bet(&h.app, "0xalice", "dogecoin", "up").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_market");

    let (status, body) = bet(&h.app, "  ", "bitcoin", "up").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_wallet");

    // Saturday
    h.clock.set(Utc.with_ymd_and_hms(2024, 6, 8, 9, 0, 0).unwrap());
    let (status, body) = bet(&h.app, "0xalice", "bitcoin", "up").await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"], "phase_closed");
}

#[tokio::test]
async fn settlement_blocks_wrong_predictors_until_unblocked() {
    let h = harness();
    assert_eq!(bet(&h.app, "0xalice", "bitcoin", "up").await.0, StatusCode::OK);
    assert_eq!(bet(&h.app, "0xbob", "bitcoin", "down").await.0, StatusCode::OK);

    let (status, summary) = call(
        &h.app,
        "POST",
        "/settlement",
        Some(json!({ "market": "bitcoin", "date": "2024-06-05", "outcome": "up" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["blocked"], json!(["0xbob"]));
    assert_eq!(summary["survivors"], json!(["0xalice"]));

    let (status, body) = bet(&h.app, "0xbob", "bitcoin", "up").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "blocked");

    let (_, status_body) = call(&h.app, "GET", "/blocks/bitcoin/0xbob", None).await;
    assert_eq!(status_body["blocked"], true);
    assert_eq!(status_body["entry"]["reason"], "wrong prediction for 2024-06-05");
    assert_eq!(status_body["entry"]["re_entry_fee_micros"], 40_000);

    let (_, entries) = call(&h.app, "GET", "/markets/bitcoin/blocks", None).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);

    let (_, removed) = call(
        &h.app,
        "POST",
        "/blocks/remove",
        Some(json!({ "wallet": "0xbob", "market": "bitcoin" })),
    )
    .await;
    assert_eq!(removed["removed"], 1);
    assert_eq!(bet(&h.app, "0xbob", "bitcoin", "up").await.0, StatusCode::OK);
}

#[tokio::test]
async fn global_block_applies_to_every_market() {
    let h = harness();
    let (status, entry) = call(
        &h.app,
        "POST",
        "/blocks",
        Some(json!({ "wallet": "0xalice", "reason": "chargeback" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["reason"], "chargeback");

    assert_eq!(bet(&h.app, "0xalice", "bitcoin", "up").await.0, StatusCode::FORBIDDEN);
    assert_eq!(bet(&h.app, "0xalice", "ethereum", "up").await.0, StatusCode::FORBIDDEN);

    let (_, removed) =
        call(&h.app, "POST", "/blocks/remove", Some(json!({ "wallet": "0xalice" }))).await;
    assert_eq!(removed["removed"], 1);
    assert_eq!(bet(&h.app, "0xalice", "ethereum", "up").await.0, StatusCode::OK);
}

#[tokio::test]
async fn referral_program_earns_and_redeems_free_entries() {
    let h = harness();
    let (status, code) = call(
        &h.app,
        "POST",
        "/referrals/code",
        Some(json!({ "wallet": "0xalice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = code["code"].as_str().unwrap().to_string();

    let (status, body) = call(
        &h.app,
        "POST",
        "/referrals/link",
        Some(json!({ "wallet": "0xalice", "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "self_referral");

    for friend in ["0xf1", "0xf2", "0xf3"] {
        let (status, _) = call(
            &h.app,
            "POST",
            "/referrals/link",
            Some(json!({ "wallet": friend, "code": code.to_lowercase() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, confirmed) = call(
            &h.app,
            "POST",
            "/referrals/confirm",
            Some(json!({ "wallet": friend })),
        )
        .await;
        assert_eq!(confirmed["newly_confirmed"], true);
    }

    let (status, body) = call(
        &h.app,
        "POST",
        "/referrals/link",
        Some(json!({ "wallet": "0xf1", "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_linked");

    let (_, unlinked) = call(
        &h.app,
        "POST",
        "/referrals/confirm",
        Some(json!({ "wallet": "0xnobody" })),
    )
    .await;
    assert!(unlinked["link"].is_null());

    let (_, stats) = call(&h.app, "GET", "/wallets/0xalice/referrals", None).await;
    assert_eq!(stats["code"], code.as_str());
    assert_eq!(stats["confirmed_referrals"], 3);
    assert_eq!(stats["entries_available"], 1);

    let (status, event) = call(
        &h.app,
        "POST",
        "/free-entries/redeem",
        Some(json!({ "wallet": "0xalice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["seq"], 1);

    let (status, body) = call(
        &h.app,
        "POST",
        "/free-entries/redeem",
        Some(json!({ "wallet": "0xalice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "no_credits_available");
}

#[tokio::test]
async fn awarded_entries_are_redeemable() {
    let h = harness();
    let (status, body) = call(
        &h.app,
        "POST",
        "/free-entries/award",
        Some(json!({ "wallet": "0xbob", "source": "wordle" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 1);

    let (status, body) = call(
        &h.app,
        "POST",
        "/free-entries/award",
        Some(json!({ "wallet": "0xbob", "source": "chess" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_source");

    call(
        &h.app,
        "POST",
        "/free-entries/redeem",
        Some(json!({ "wallet": "0xbob" })),
    )
    .await;
    let (_, body) = call(&h.app, "GET", "/wallets/0xbob/free-entries", None).await;
    assert_eq!(body["available"], 0);
    assert_eq!(body["redemptions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn redeem_retry_with_request_id_spends_once() {
    let h = harness();
    for _ in 0..2 {
        call(
            &h.app,
            "POST",
            "/free-entries/award",
            Some(json!({ "wallet": "0xbob", "source": "trivia" })),
        )
        .await;
    }
    let req = json!({ "wallet": "0xbob", "request_id": "checkout-42" });
    let (status, first) = call(&h.app, "POST", "/free-entries/redeem", Some(req.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["request_id"], "checkout-42");

    let (status, retry) = call(&h.app, "POST", "/free-entries/redeem", Some(req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retry, first);

    let (_, body) = call(&h.app, "GET", "/wallets/0xbob/free-entries", None).await;
    assert_eq!(body["available"], 1);
    assert_eq!(body["redemptions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_dates_get_the_json_error_shape() {
    let h = harness();
    for uri in [
        "/bets/bitcoin/0xalice/not-a-date",
        "/bets/bitcoin/0xalice/2024-02-30",
        "/markets/bitcoin/bets/20240605",
    ] {
        let (status, body) = call(&h.app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "invalid_date");
        assert_eq!(body["class"], "validation");
    }

    let (status, body) = call(
        &h.app,
        "POST",
        "/settlement",
        Some(json!({ "market": "bitcoin", "date": "june 5th", "outcome": "up" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_date");
}

#[tokio::test]
async fn closed_weekend_view_keeps_the_last_bet() {
    let h = harness();
    assert_eq!(bet(&h.app, "0xalice", "bitcoin", "up").await.0, StatusCode::OK);
    h.clock.set(Utc.with_ymd_and_hms(2024, 6, 8, 12, 0, 0).unwrap());

    let (status, view) = call(&h.app, "GET", "/bets/bitcoin/0xalice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "closed");
    assert!(view["tomorrow_prediction"].is_null());
    assert_eq!(view["awaiting_settlement"], false);
    assert_eq!(view["last_result"]["target_date"], "2024-06-05");
}

#[tokio::test]
async fn accepted_bets_are_published_on_the_bus() {
    let h = harness();
    let mut rx = h.state.bus.subscribe();
    assert_eq!(bet(&h.app, "0xalice", "bitcoin", "up").await.0, StatusCode::OK);
    match rx.recv().await.unwrap() {
        LedgerEvent::BetPlaced(outcome) => assert_eq!(outcome.bet.wallet.as_str(), "0xalice"),
        other => panic!("unexpected event {other:?}"),
    }
}
