mod common;

use common::{app_with, polling_config, wait_for, ScriptedBackend};
use std::time::Duration;
use voidchat_lib::api::ClaimReply;
use voidchat_lib::billing::BillingWorkflow;
use voidchat_lib::models::BillingState;
use voidchat_lib::state::AppEvent;
use voidchat_lib::storage::keys;

const TIMEOUT_MESSAGE: &str = "Timeout. If you paid, click Claim. Otherwise create a new invoice.";

fn billing_is(expected: BillingState) -> impl FnMut(&AppEvent) -> bool {
    move |event| matches!(event, AppEvent::BillingChanged { state, .. } if *state == expected)
}

#[tokio::test]
async fn timer_claims_until_paid() {
    let backend = ScriptedBackend::new();
    backend.push_claim(ClaimReply::Pending);
    backend.push_claim(ClaimReply::Token("tok_auto".into()));
    let app = app_with(backend.clone(), polling_config(20, 10_000), &[]).await;
    let billing = BillingWorkflow::restore(app.clone()).await;
    let mut events = app.subscribe();

    assert_eq!(billing.create_invoice().await, BillingState::Waiting);
    assert!(backend.claims().is_empty());

    // the token is installed before the workflow reports done
    wait_for(&mut events, billing_is(BillingState::Done)).await;

    assert_eq!(backend.claims().len(), 2);
    assert_eq!(billing.snapshot().await.state, BillingState::Done);
    assert_eq!(app.storage.get(keys::PRO_TOKEN).as_deref(), Some("tok_auto"));

    // polling ends once the invoice is settled
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.claims().len(), 2);
}

#[tokio::test]
async fn hidden_client_pauses_timer_claims() {
    let backend = ScriptedBackend::new();
    let app = app_with(backend.clone(), polling_config(20, 10_000), &[]).await;
    let billing = BillingWorkflow::restore(app.clone()).await;

    app.set_visible(false);
    billing.create_invoice().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(backend.claims().is_empty());
    assert_eq!(billing.snapshot().await.state, BillingState::Waiting);

    let mut events = app.subscribe();
    app.set_visible(true);
    wait_for(&mut events, billing_is(BillingState::Claiming)).await;
    wait_for(&mut events, billing_is(BillingState::Waiting)).await;
    assert!(!backend.claims().is_empty());
}

#[tokio::test]
async fn timer_gives_up_after_timeout() {
    let backend = ScriptedBackend::new();
    let app = app_with(backend.clone(), polling_config(20, 80), &[]).await;
    let billing = BillingWorkflow::restore(app.clone()).await;
    let mut events = app.subscribe();

    billing.create_invoice().await;
    let event = wait_for(&mut events, billing_is(BillingState::Error)).await;
    match event {
        AppEvent::BillingChanged { message, .. } => assert_eq!(message, TIMEOUT_MESSAGE),
        other => panic!("unexpected event {:?}", other),
    }

    let snapshot = billing.snapshot().await;
    assert_eq!(snapshot.invoice.unwrap().id, "inv_1");
    let claims = backend.claims().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.claims().len(), claims);
}

#[tokio::test]
async fn manual_check_after_timeout_resumes_timer() {
    let backend = ScriptedBackend::new();
    let app = app_with(backend.clone(), polling_config(20, 80), &[]).await;
    let billing = BillingWorkflow::restore(app.clone()).await;
    let mut events = app.subscribe();

    billing.create_invoice().await;
    wait_for(&mut events, billing_is(BillingState::Error)).await;

    let before = backend.claims().len();
    assert_eq!(billing.check_payment().await, BillingState::Waiting);
    assert_eq!(backend.claims().len(), before + 1);

    let mut events = app.subscribe();
    wait_for(&mut events, billing_is(BillingState::Claiming)).await;
    wait_for(&mut events, billing_is(BillingState::Waiting)).await;
    assert!(backend.claims().len() >= before + 2);
}

#[tokio::test]
async fn cancelling_during_a_paid_claim_keeps_the_token() {
    let backend = ScriptedBackend::new();
    backend.push_claim(ClaimReply::Token("tok_paid".into()));
    let release = backend.gate_next_claim();
    let app = app_with(backend.clone(), polling_config(20, 10_000), &[]).await;
    let billing = BillingWorkflow::restore(app.clone()).await;
    let mut events = app.subscribe();

    billing.create_invoice().await;
    tokio::time::timeout(Duration::from_secs(5), backend.claim_started.notified())
        .await
        .expect("timer never claimed");

    billing.cancel_invoice().await;
    release.send(()).unwrap();

    wait_for(&mut events, |e| matches!(e, AppEvent::Notice(text) if text == "Token saved.")).await;
    wait_for(&mut events, |e| matches!(e, AppEvent::EntitlementChanged(s) if s.pro_token.is_some())).await;

    assert_eq!(
        app.entitlement.snapshot().await.pro_token.as_deref(),
        Some("tok_paid")
    );
    assert_eq!(app.storage.get(keys::PRO_TOKEN).as_deref(), Some("tok_paid"));
    assert!(app.storage.get(keys::INVOICE_ID).is_none());
}
