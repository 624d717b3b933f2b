mod common;

use common::{app_with, test_config};
use serde_json::json;
use std::sync::Arc;
use voidchat_lib::api::HttpBackend;
use voidchat_lib::billing::BillingWorkflow;
use voidchat_lib::models::{BillingState, ProStatus};
use voidchat_lib::state::{AppEvent, AppState};
use voidchat_lib::storage::keys;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup(server: &MockServer, seed: &[(&str, &str)]) -> (AppState, BillingWorkflow) {
    let api = Arc::new(HttpBackend::new(server.uri()));
    let app = app_with(api, test_config(0), seed).await;
    let billing = BillingWorkflow::restore(app.clone()).await;
    (app, billing)
}

async fn mount_invoice(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/pro/create-invoice"))
        .and(body_json(json!({"amount": "4", "currency": "USD", "credits": 5000})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "invoiceId": "inv_1",
            "checkoutLink": "https://pay.example/inv_1"
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_claim(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/pro/claim"))
        .and(body_json(json!({"invoiceId": "inv_1"})))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn waiting_on_invoice(server: &MockServer) -> (AppState, BillingWorkflow) {
    mount_invoice(server).await;
    let (app, billing) = setup(server, &[]).await;
    billing.select_plan("plus").await.unwrap();
    assert_eq!(billing.create_invoice().await, BillingState::Waiting);
    (app, billing)
}

#[tokio::test]
async fn created_invoice_is_persisted_and_pending_claim_keeps_waiting() {
    let server = MockServer::start().await;
    let (app, billing) = waiting_on_invoice(&server).await;

    assert_eq!(app.storage.get(keys::INVOICE_ID).as_deref(), Some("inv_1"));
    assert_eq!(
        app.storage.get(keys::CHECKOUT_LINK).as_deref(),
        Some("https://pay.example/inv_1")
    );
    assert_eq!(app.storage.get(keys::PLAN_ID).as_deref(), Some("plus"));

    mount_claim(&server, ResponseTemplate::new(404)).await;
    assert!(billing.poll_once().await);

    let snapshot = billing.snapshot().await;
    assert_eq!(snapshot.state, BillingState::Waiting);
    assert_eq!(snapshot.invoice.unwrap().id, "inv_1");
}

#[tokio::test]
async fn already_claimed_invoice_is_terminal() {
    let server = MockServer::start().await;
    let (app, billing) = waiting_on_invoice(&server).await;

    mount_claim(&server, ResponseTemplate::new(409)).await;
    assert!(!billing.poll_once().await);

    let snapshot = billing.snapshot().await;
    assert_eq!(snapshot.state, BillingState::Error);
    assert_eq!(
        snapshot.message,
        "This invoice was already claimed. Create a new invoice."
    );
    assert!(snapshot.invoice.is_none());
    assert!(app.storage.get(keys::INVOICE_ID).is_none());
}

#[tokio::test]
async fn paid_claim_installs_token_and_refreshes_status() {
    let server = MockServer::start().await;
    let (app, billing) = waiting_on_invoice(&server).await;
    let mut events = app.subscribe();

    mount_claim(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"token": "tok_new"})),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/pro/status"))
        .and(header("x-void-pro-token", "tok_new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"credits_left": 5000})))
        .expect(1)
        .mount(&server)
        .await;

    assert!(!billing.poll_once().await);

    let snapshot = billing.snapshot().await;
    assert_eq!(snapshot.state, BillingState::Done);
    assert!(snapshot.invoice.is_none());
    assert!(app.storage.get(keys::INVOICE_ID).is_none());

    let entitlement = app.entitlement.snapshot().await;
    assert_eq!(entitlement.pro_token.as_deref(), Some("tok_new"));
    assert_eq!(entitlement.pro_status, ProStatus::Active);
    assert_eq!(entitlement.pro_remaining, Some(5000));
    assert_eq!(app.storage.get(keys::PRO_TOKEN).as_deref(), Some("tok_new"));

    let mut statuses = Vec::new();
    let mut saw_notice = false;
    while let Ok(event) = events.try_recv() {
        match event {
            AppEvent::EntitlementChanged(state) => statuses.push(state.pro_status),
            AppEvent::Notice(text) => saw_notice |= text == "Token saved.",
            _ => {}
        }
    }
    assert_eq!(statuses, [ProStatus::Checking, ProStatus::Active]);
    assert!(saw_notice);
}

#[tokio::test]
async fn hidden_client_does_not_poll() {
    let server = MockServer::start().await;
    let (app, billing) = waiting_on_invoice(&server).await;
    Mock::given(method("POST"))
        .and(path("/pro/claim"))
        .respond_with(ResponseTemplate::new(404))
        .expect(0)
        .mount(&server)
        .await;

    app.set_visible(false);
    assert!(billing.poll_once().await);
    assert_eq!(billing.snapshot().await.state, BillingState::Waiting);
}

#[tokio::test]
async fn pending_invoice_resumes_after_restart_and_can_be_cancelled() {
    let server = MockServer::start().await;
    let (app, billing) = setup(
        &server,
        &[
            (keys::INVOICE_ID, "inv_9"),
            (keys::CHECKOUT_LINK, "https://pay.example/inv_9"),
            (keys::PLAN_ID, "max"),
        ],
    )
    .await;

    let snapshot = billing.snapshot().await;
    assert_eq!(snapshot.state, BillingState::Waiting);
    assert_eq!(snapshot.plan_id, "max");
    let invoice = snapshot.invoice.unwrap();
    assert_eq!(invoice.id, "inv_9");
    assert_eq!(invoice.checkout_link.as_deref(), Some("https://pay.example/inv_9"));

    billing.cancel_invoice().await;
    assert_eq!(billing.snapshot().await.state, BillingState::Idle);
    assert!(app.storage.get(keys::INVOICE_ID).is_none());
    assert!(app.storage.get(keys::CHECKOUT_LINK).is_none());
}

#[tokio::test]
async fn invoice_creation_failures_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pro/create-invoice"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pro/create-invoice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"checkoutLink": "x"})))
        .mount(&server)
        .await;
    let (app, billing) = setup(&server, &[]).await;

    assert_eq!(billing.create_invoice().await, BillingState::Error);
    assert_eq!(billing.snapshot().await.message, "Create invoice failed (HTTP 500).");

    assert_eq!(billing.create_invoice().await, BillingState::Error);
    assert_eq!(
        billing.snapshot().await.message,
        "Create invoice ok, but invoiceId is missing."
    );
    assert!(app.storage.get(keys::INVOICE_ID).is_none());
}

#[tokio::test]
async fn manual_check_without_invoice_claims_by_plan() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pro/claim"))
        .and(body_json(json!({
            "planId": "starter",
            "amount": "1",
            "currency": "USD",
            "credits": 1000
        })))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let (_app, billing) = setup(&server, &[]).await;

    assert_eq!(billing.check_payment().await, BillingState::Idle);
    assert_eq!(billing.snapshot().await.message, "No confirmed payment found yet.");
}
