//! Billing workflow: invoice creation, automatic claim polling and the
//! manual "check payment" path.
//!
//! Payment settles on an external ledger the client cannot subscribe to, so
//! the workflow polls the claim endpoint. The transitions live in
//! [`BillingMachine`], which is pure and clock-injected; [`BillingWorkflow`]
//! drives it with network calls and a timer.

use crate::api::{ClaimReply, ClaimRequest, InvoiceRequest};
use crate::error::ApiError;
use crate::models::{BillingState, Invoice, Plan};
use crate::state::{AppEvent, AppState};
use crate::storage::keys;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const CURRENCY: &str = "USD";

const MSG_RESTORED: &str = "Payment pending. Waiting for confirmation…";
const MSG_CREATED: &str = "Invoice created. Waiting for payment confirmation…";
const MSG_WAITING: &str = "Waiting for payment confirmation…";
const MSG_TEMPORARY: &str = "Waiting for confirmation… (temporary network issue)";
const MSG_PAID: &str = "Payment confirmed. Credits unlocked.";
const MSG_ALREADY_CLAIMED: &str = "This invoice was already claimed. Create a new invoice.";
const MSG_TIMEOUT: &str = "Timeout. If you paid, click Claim. Otherwise create a new invoice.";
const MSG_NOT_FOUND_YET: &str = "No confirmed payment found yet.";

/// Result of one claim attempt, as the workflow sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Paid(String),
    Pending,
    AlreadyClaimed,
    Failed(String),
    Unreachable,
}

impl From<Result<ClaimReply, ApiError>> for ClaimOutcome {
    fn from(result: Result<ClaimReply, ApiError>) -> Self {
        match result {
            Ok(ClaimReply::Token(token)) => ClaimOutcome::Paid(token),
            Ok(ClaimReply::Pending) => ClaimOutcome::Pending,
            Ok(ClaimReply::AlreadyClaimed) => ClaimOutcome::AlreadyClaimed,
            Ok(ClaimReply::Failed(status)) => ClaimOutcome::Failed(format!("HTTP {}", status)),
            Err(e) if e.is_transport() => ClaimOutcome::Unreachable,
            Err(e) => ClaimOutcome::Failed(e.to_string()),
        }
    }
}

/// What the poll timer should do on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    Stop,
    Skip,
    Claim(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingRejected {
    UnknownPlan,
    Busy,
}

/// Finite-state core of the workflow.
#[derive(Debug, Clone)]
pub struct BillingMachine {
    pub state: BillingState,
    pub message: String,
    pub invoice: Option<Invoice>,
    pub plan_id: String,
    poll_started: Option<Instant>,
}

impl BillingMachine {
    pub fn new(plan_id: &str) -> Self {
        Self {
            state: BillingState::Idle,
            message: String::new(),
            invoice: None,
            plan_id: Plan::find(plan_id).id.to_string(),
            poll_started: None,
        }
    }

    /// Resumes waiting on an invoice created in an earlier run.
    pub fn restore(&mut self, invoice: Invoice, now: Instant) {
        self.invoice = Some(invoice);
        self.state = BillingState::Waiting;
        self.message = MSG_RESTORED.to_string();
        self.poll_started = Some(now);
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, BillingState::Creating | BillingState::Claiming)
    }

    pub fn select_plan(&mut self, plan_id: &str) -> Result<Plan, BillingRejected> {
        let plan = crate::models::PLANS
            .iter()
            .copied()
            .find(|p| p.id == plan_id)
            .ok_or(BillingRejected::UnknownPlan)?;
        self.plan_id = plan.id.to_string();
        Ok(plan)
    }

    pub fn begin_create(&mut self) -> Result<Plan, BillingRejected> {
        if self.is_busy() {
            return Err(BillingRejected::Busy);
        }
        self.state = BillingState::Creating;
        self.message.clear();
        Ok(Plan::find(&self.plan_id))
    }

    /// A new invoice replaces any previous one.
    pub fn invoice_created(&mut self, id: String, checkout_link: Option<String>, now: Instant) {
        self.invoice = Some(Invoice {
            id,
            checkout_link,
            plan_id: self.plan_id.clone(),
        });
        self.state = BillingState::Waiting;
        self.message = MSG_CREATED.to_string();
        self.poll_started = Some(now);
    }

    pub fn invoice_failed(&mut self, message: String) {
        self.state = BillingState::Error;
        self.message = message;
    }

    /// Timer tick. Gives up after `timeout` of waiting, skips while the
    /// client is hidden or a claim is already in flight.
    pub fn tick(&mut self, now: Instant, visible: bool, timeout: Duration) -> PollAction {
        let polling = matches!(self.state, BillingState::Waiting | BillingState::Claiming);
        let (true, Some(invoice)) = (polling, self.invoice.as_ref()) else {
            return PollAction::Stop;
        };
        let started = *self.poll_started.get_or_insert(now);
        if now.duration_since(started) > timeout {
            self.state = BillingState::Error;
            self.message = MSG_TIMEOUT.to_string();
            self.poll_started = None;
            return PollAction::Stop;
        }
        if self.state == BillingState::Claiming || !visible {
            return PollAction::Skip;
        }
        let invoice_id = invoice.id.clone();
        self.state = BillingState::Claiming;
        PollAction::Claim(invoice_id)
    }

    /// Manual claim request: by invoice when there is one, else by plan.
    pub fn begin_manual_claim(&mut self) -> Result<ClaimRequest, BillingRejected> {
        if self.is_busy() {
            return Err(BillingRejected::Busy);
        }
        self.state = BillingState::Claiming;
        Ok(match &self.invoice {
            Some(invoice) => ClaimRequest::Invoice {
                invoice_id: invoice.id.clone(),
            },
            None => {
                let plan = Plan::find(&self.plan_id);
                ClaimRequest::Plan {
                    plan_id: plan.id.to_string(),
                    amount: plan.price_usd.to_string(),
                    currency: CURRENCY.to_string(),
                    credits: plan.credits,
                }
            }
        })
    }

    /// Applies a claim outcome. Returns the token to install when paid.
    pub fn apply_claim(&mut self, outcome: ClaimOutcome) -> Option<String> {
        if let ClaimOutcome::Paid(token) = outcome {
            self.state = BillingState::Done;
            self.message = MSG_PAID.to_string();
            self.invoice = None;
            self.poll_started = None;
            return Some(token);
        }
        if self.state != BillingState::Claiming {
            // overtaken by a timeout, cancellation or a new invoice
            return None;
        }
        match outcome {
            ClaimOutcome::Pending if self.invoice.is_some() => {
                self.state = BillingState::Waiting;
                self.message = MSG_WAITING.to_string();
            }
            ClaimOutcome::Pending => {
                self.state = BillingState::Idle;
                self.message = MSG_NOT_FOUND_YET.to_string();
            }
            ClaimOutcome::AlreadyClaimed => {
                self.state = BillingState::Error;
                self.message = MSG_ALREADY_CLAIMED.to_string();
                self.invoice = None;
                self.poll_started = None;
            }
            ClaimOutcome::Failed(detail) => {
                self.state = BillingState::Error;
                self.message = format!("Claim failed ({}).", detail);
            }
            ClaimOutcome::Unreachable if self.invoice.is_some() => {
                self.state = BillingState::Waiting;
                self.message = MSG_TEMPORARY.to_string();
            }
            ClaimOutcome::Unreachable => {
                self.state = BillingState::Error;
                self.message = "Claim failed (network error).".to_string();
            }
            ClaimOutcome::Paid(_) => {}
        }
        None
    }

    /// Drops the invoice and returns to idle.
    pub fn cancel(&mut self) {
        self.invoice = None;
        self.state = BillingState::Idle;
        self.message.clear();
        self.poll_started = None;
    }
}

/// Async driver around [`BillingMachine`].
#[derive(Clone)]
pub struct BillingWorkflow {
    app: AppState,
    machine: Arc<Mutex<BillingMachine>>,
    // Stop signal of the timer task. Stopping is cooperative: a claim already
    // in flight runs to completion and is applied.
    poller: Arc<Mutex<Option<CancellationToken>>>,
}

impl BillingWorkflow {
    /// Restores the selected plan and any pending invoice; a pending invoice
    /// resumes polling.
    pub async fn restore(app: AppState) -> Self {
        let plan_id = app.storage.get_trimmed(keys::PLAN_ID).unwrap_or_default();
        let mut machine = BillingMachine::new(&plan_id);
        if let Some(id) = app.storage.get_trimmed(keys::INVOICE_ID) {
            log::info!("Resuming pending invoice {}", crate::identity::short_id(&id));
            let invoice = Invoice {
                id,
                checkout_link: app.storage.get_trimmed(keys::CHECKOUT_LINK),
                plan_id: machine.plan_id.clone(),
            };
            machine.restore(invoice, Instant::now());
        }
        let resume = machine.state == BillingState::Waiting;

        let workflow = Self {
            app,
            machine: Arc::new(Mutex::new(machine)),
            poller: Arc::new(Mutex::new(None)),
        };
        if resume {
            workflow.start_poller().await;
        }
        workflow
    }

    pub async fn snapshot(&self) -> BillingMachine {
        self.machine.lock().await.clone()
    }

    pub async fn select_plan(&self, plan_id: &str) -> Result<Plan, BillingRejected> {
        let plan = self.machine.lock().await.select_plan(plan_id)?;
        self.app.storage.persist(keys::PLAN_ID, plan.id).await;
        Ok(plan)
    }

    /// Creates an invoice for the selected plan and starts polling it.
    pub async fn create_invoice(&self) -> BillingState {
        let begun = self.machine.lock().await.begin_create();
        let plan = match begun {
            Ok(plan) => plan,
            Err(_) => return self.machine.lock().await.state,
        };
        self.stop_poller().await;
        self.publish().await;

        let request = InvoiceRequest {
            amount: plan.price_usd.to_string(),
            currency: CURRENCY.to_string(),
            credits: plan.credits,
        };
        let result = self.app.api.create_invoice(&request).await;

        {
            let mut machine = self.machine.lock().await;
            match result {
                Ok(created) => {
                    log::info!("Invoice {} created", crate::identity::short_id(&created.invoice_id));
                    machine.invoice_created(created.invoice_id, created.checkout_link, Instant::now());
                }
                Err(ApiError::UnexpectedStatus { status, .. }) => {
                    machine.invoice_failed(format!("Create invoice failed (HTTP {}).", status));
                }
                Err(ApiError::MissingField(_)) => {
                    machine.invoice_failed("Create invoice ok, but invoiceId is missing.".to_string());
                }
                Err(e) => {
                    log::error!("Invoice creation failed: {}", e);
                    machine.invoice_failed("Create invoice failed (network error).".to_string());
                }
            }
        }

        self.persist_invoice().await;
        self.publish().await;
        let state = self.machine.lock().await.state;
        if state == BillingState::Waiting {
            self.start_poller().await;
        }
        state
    }

    /// User-triggered claim attempt outside the timer.
    pub async fn check_payment(&self) -> BillingState {
        let begun = self.machine.lock().await.begin_manual_claim();
        let request = match begun {
            Ok(request) => request,
            Err(_) => return self.machine.lock().await.state,
        };
        self.publish().await;
        let outcome = ClaimOutcome::from(self.app.api.claim(&request).await);
        let state = self.apply(outcome).await;
        if state == BillingState::Waiting {
            // also revives the timer of an invoice that had timed out
            self.start_poller().await;
        }
        state
    }

    /// One timer tick. Returns whether polling should continue.
    pub async fn poll_once(&self) -> bool {
        let action = {
            let mut machine = self.machine.lock().await;
            let before = machine.state;
            let action = machine.tick(
                Instant::now(),
                self.app.is_visible(),
                self.app.config.poll_timeout,
            );
            (action, before != machine.state)
        };
        match action {
            (PollAction::Stop, changed) => {
                if changed {
                    log::warn!("Invoice polling timed out");
                    self.persist_invoice().await;
                    self.publish().await;
                }
                false
            }
            (PollAction::Skip, _) => true,
            (PollAction::Claim(invoice_id), _) => {
                self.publish().await;
                let request = ClaimRequest::Invoice { invoice_id };
                let outcome = ClaimOutcome::from(self.app.api.claim(&request).await);
                let state = self.apply(outcome).await;
                matches!(state, BillingState::Waiting | BillingState::Claiming)
            }
        }
    }

    /// Drops the pending invoice and stops polling.
    pub async fn cancel_invoice(&self) {
        self.stop_poller().await;
        self.machine.lock().await.cancel();
        self.persist_invoice().await;
        self.publish().await;
        log::info!("Invoice cancelled");
    }

    async fn apply(&self, outcome: ClaimOutcome) -> BillingState {
        log::debug!("Claim outcome: {:?}", outcome);
        let (token, state) = {
            let mut machine = self.machine.lock().await;
            let token = machine.apply_claim(outcome);
            (token, machine.state)
        };

        if let Some(token) = token {
            log::info!("Payment confirmed, installing new pro token");
            self.app.emit(AppEvent::Notice("Token saved.".to_string()));
            self.app.entitlement.install_token(&token).await;
        }
        self.persist_invoice().await;
        self.publish().await;
        state
    }

    async fn start_poller(&self) {
        let mut slot = self.poller.lock().await;
        if let Some(old) = slot.take() {
            old.cancel();
        }
        let this = self.clone();
        let every = self.app.config.poll_interval;
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !this.poll_once().await {
                    log::debug!("Invoice polling finished");
                    break;
                }
            }
        });
        *slot = Some(cancel);
    }

    async fn stop_poller(&self) {
        if let Some(cancel) = self.poller.lock().await.take() {
            cancel.cancel();
        }
    }

    async fn persist_invoice(&self) {
        let invoice = self.machine.lock().await.invoice.clone();
        let storage = &self.app.storage;
        match invoice {
            Some(invoice) => {
                storage.persist(keys::INVOICE_ID, &invoice.id).await;
                storage
                    .persist_opt(keys::CHECKOUT_LINK, invoice.checkout_link.as_deref())
                    .await;
            }
            None => {
                storage.persist(keys::INVOICE_ID, "").await;
                storage.persist(keys::CHECKOUT_LINK, "").await;
            }
        }
    }

    async fn publish(&self) {
        let (state, message, checkout_link) = {
            let machine = self.machine.lock().await;
            (
                machine.state,
                machine.message.clone(),
                machine.invoice.as_ref().and_then(|i| i.checkout_link.clone()),
            )
        };
        self.app.emit(AppEvent::BillingChanged {
            state,
            message,
            checkout_link,
        });
    }
}
