// Command surface: maps user gestures from the front end onto core operations

use crate::billing::{BillingRejected, BillingWorkflow};
use crate::models::{ExportBundle, PLANS};
use crate::session::{GenerationController, SendRejected};
use crate::state::AppState;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything a front end needs to drive the client.
#[derive(Clone)]
pub struct CommandContext {
    pub state: AppState,
    pub sessions: GenerationController,
    pub billing: BillingWorkflow,
}

impl CommandContext {
    /// Wires the components around `state`, resumes a pending invoice and
    /// starts resolving a stored pro token in the background.
    pub async fn start(state: AppState) -> Self {
        let sessions = GenerationController::new(state.clone());
        let billing = BillingWorkflow::restore(state.clone()).await;

        let entitlement = state.entitlement.clone();
        tokio::spawn(async move {
            entitlement.refresh_current().await;
        });

        Self {
            state,
            sessions,
            billing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Stop,
    Regenerate,
    NewChat,
    List,
    Load(String),
    Rename(String, String),
    Pin(String, bool),
    Duplicate(String),
    Delete(String),
    Export(PathBuf),
    Import(PathBuf),
    Token(String),
    Status,
    Plans,
    Plan(String),
    Buy,
    Check,
    CancelInvoice,
    Models,
    Model(String),
    Visible(bool),
    Help,
    Quit,
    Unknown(String),
}

pub const HELP: &str = "\
Type a message to send it. Commands:
  /stop /regen /new               control the current reply and chat
  /list /load <id> /rename <id> <title> /pin <id> /unpin <id>
  /dup <id> /delete <id> /export <file> /import <file>
  /token [<token>]                link a pro token (no argument unlinks)
  /status                         show credits and billing state
  /plans /plan <id> /buy /check /cancel
  /models /model <name>
  /hide /show                     pause or resume payment polling
  /quit";

/// Parses one input line. Lines not starting with `/` are prompts.
pub fn parse(line: &str) -> Command {
    let line = line.trim();
    if !line.starts_with('/') {
        return Command::Send(line.to_string());
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();
    let arg = || rest.to_string();

    match name {
        "/stop" => Command::Stop,
        "/regen" => Command::Regenerate,
        "/new" | "/clear" => Command::NewChat,
        "/list" => Command::List,
        "/load" => Command::Load(arg()),
        "/rename" => {
            let mut split = rest.splitn(2, char::is_whitespace);
            let id = split.next().unwrap_or_default().to_string();
            let title = split.next().unwrap_or_default().trim().to_string();
            Command::Rename(id, title)
        }
        "/pin" => Command::Pin(arg(), true),
        "/unpin" => Command::Pin(arg(), false),
        "/dup" => Command::Duplicate(arg()),
        "/delete" => Command::Delete(arg()),
        "/export" => Command::Export(PathBuf::from(rest)),
        "/import" => Command::Import(PathBuf::from(rest)),
        "/token" => Command::Token(arg()),
        "/status" => Command::Status,
        "/plans" => Command::Plans,
        "/plan" => Command::Plan(arg()),
        "/buy" => Command::Buy,
        "/check" => Command::Check,
        "/cancel" => Command::CancelInvoice,
        "/models" => Command::Models,
        "/model" => Command::Model(arg()),
        "/hide" => Command::Visible(false),
        "/show" => Command::Visible(true),
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Runs a command and returns a line of feedback for the user.
pub async fn execute(ctx: &CommandContext, command: Command) -> Result<String, String> {
    log::debug!("Executing command {:?}", command);
    match command {
        Command::Send(text) => match ctx.sessions.send(&text).await {
            Ok(_) => Ok(String::new()),
            Err(reason) => Err(describe_rejection(reason)),
        },
        Command::Stop => {
            if ctx.sessions.stop().await {
                Ok("Stopped.".to_string())
            } else {
                Ok("Nothing to stop.".to_string())
            }
        }
        Command::Regenerate => match ctx.sessions.regenerate().await {
            Ok(_) => Ok(String::new()),
            Err(reason) => Err(describe_rejection(reason)),
        },
        Command::NewChat => {
            ctx.sessions.new_chat().await;
            Ok("New chat. What do you want to do?".to_string())
        }
        Command::List => {
            let transcripts = ctx.state.transcripts.lock().await;
            let active = transcripts.active_id();
            let lines: Vec<String> = transcripts
                .list()
                .into_iter()
                .map(|meta| {
                    format!(
                        "{} {}{} {} ({})",
                        if Some(meta.id) == active { "*" } else { " " },
                        if meta.pinned { "[pinned] " } else { "" },
                        meta.id,
                        meta.title,
                        meta.updated_at.format("%Y-%m-%d %H:%M")
                    )
                })
                .collect();
            if lines.is_empty() {
                Ok("No conversations yet.".to_string())
            } else {
                Ok(lines.join("\n"))
            }
        }
        Command::Load(id) => {
            let id = parse_id(&id)?;
            ctx.sessions
                .load_chat(id)
                .await
                .map_err(|e| format!("Failed to load conversation: {}", e))?;
            let transcripts = ctx.state.transcripts.lock().await;
            let rendered: Vec<String> = transcripts
                .messages()
                .iter()
                .map(|m| {
                    let suffix = if m.interrupted { " [stopped]" } else { "" };
                    format!("{}> {}{}", m.role.as_str(), m.text, suffix)
                })
                .collect();
            Ok(rendered.join("\n"))
        }
        Command::Rename(id, title) => {
            let id = parse_id(&id)?;
            ctx.state
                .transcripts
                .lock()
                .await
                .rename(id, &title)
                .await
                .map_err(|e| format!("Failed to rename conversation: {}", e))?;
            Ok("Renamed.".to_string())
        }
        Command::Pin(id, pinned) => {
            let id = parse_id(&id)?;
            ctx.state
                .transcripts
                .lock()
                .await
                .set_pinned(id, pinned)
                .await
                .map_err(|e| format!("Failed to update conversation: {}", e))?;
            Ok(if pinned { "Pinned." } else { "Unpinned." }.to_string())
        }
        Command::Duplicate(id) => {
            let id = parse_id(&id)?;
            let copy = ctx
                .state
                .transcripts
                .lock()
                .await
                .duplicate(id)
                .await
                .map_err(|e| format!("Failed to duplicate conversation: {}", e))?;
            Ok(format!("Duplicated as {}.", copy))
        }
        Command::Delete(id) => {
            let id = parse_id(&id)?;
            ctx.sessions
                .delete_chat(id)
                .await
                .map_err(|e| format!("Failed to delete conversation: {}", e))?;
            Ok("Deleted.".to_string())
        }
        Command::Export(path) => {
            let bundle = ctx.state.transcripts.lock().await.export().await;
            let json = serde_json::to_string_pretty(&bundle)
                .map_err(|e| format!("Failed to encode export: {}", e))?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            Ok(format!(
                "Exported {} conversations to {}.",
                bundle.index.len(),
                path.display()
            ))
        }
        Command::Import(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            let bundle: ExportBundle =
                serde_json::from_str(&raw).map_err(|e| format!("Not a chat export: {}", e))?;
            let added = ctx
                .state
                .transcripts
                .lock()
                .await
                .import(bundle)
                .await
                .map_err(|e| format!("Import failed: {}", e))?;
            Ok(format!("Imported {} conversations.", added))
        }
        Command::Token(token) => {
            let status = ctx.state.entitlement.activate_token(&token).await;
            if token.trim().is_empty() {
                Ok("Token removed.".to_string())
            } else {
                Ok(format!("Token saved ({:?}).", status))
            }
        }
        Command::Status => {
            let entitlement = ctx.state.entitlement.snapshot().await;
            let billing = ctx.billing.snapshot().await;
            let mut lines = vec![
                format!(
                    "Client: {}",
                    crate::identity::short_id(&ctx.state.identity.client_id)
                ),
                format!("Free left: {}", entitlement.free_remaining),
                entitlement.pro_line(),
                format!("Session: {:?}", ctx.sessions.status().await),
                format!("Billing: {:?} (plan {})", billing.state, billing.plan_id),
            ];
            if !billing.message.is_empty() {
                lines.push(billing.message.clone());
            }
            if let Some(invoice) = &billing.invoice {
                lines.push(format!("Invoice: {}", crate::identity::short_id(&invoice.id)));
                if let Some(link) = &invoice.checkout_link {
                    lines.push(format!("Checkout: {}", link));
                }
            }
            Ok(lines.join("\n"))
        }
        Command::Plans => Ok(PLANS
            .iter()
            .map(|p| format!("{:8} {:>6} credits  ${}", p.id, p.credits, p.price_usd))
            .collect::<Vec<_>>()
            .join("\n")),
        Command::Plan(id) => match ctx.billing.select_plan(&id).await {
            Ok(plan) => Ok(format!("Selected {} ({} credits).", plan.title, plan.credits)),
            Err(reason) => Err(describe_billing_rejection(reason)),
        },
        Command::Buy => {
            let state = ctx.billing.create_invoice().await;
            let snapshot = ctx.billing.snapshot().await;
            let link = snapshot
                .invoice
                .and_then(|i| i.checkout_link)
                .map(|l| format!("\nCheckout: {}", l))
                .unwrap_or_default();
            Ok(format!("{:?}: {}{}", state, snapshot.message, link))
        }
        Command::Check => {
            let state = ctx.billing.check_payment().await;
            let snapshot = ctx.billing.snapshot().await;
            Ok(format!("{:?}: {}", state, snapshot.message))
        }
        Command::CancelInvoice => {
            ctx.billing.cancel_invoice().await;
            Ok("Invoice cleared.".to_string())
        }
        Command::Models => {
            let models = ctx
                .state
                .api
                .list_models()
                .await
                .map_err(|e| format!("Failed to list models: {}", e))?;
            let selected = ctx.state.selected_model().or(models.default.clone());
            Ok(models
                .models
                .iter()
                .map(|m| {
                    let marker = if Some(m) == selected.as_ref() { "*" } else { " " };
                    format!("{} {}", marker, m)
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Model(name) => {
            ctx.state.select_model(&name).await;
            Ok(format!("Model set to {}.", name.trim()))
        }
        Command::Visible(visible) => {
            ctx.state.set_visible(visible);
            Ok(String::new())
        }
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
        Command::Unknown(name) => Err(format!("Unknown command {}. Try /help.", name)),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        let err_msg = format!("Invalid conversation ID format: {}", raw);
        log::error!("{}", err_msg);
        err_msg
    })
}

fn describe_rejection(reason: SendRejected) -> String {
    match reason {
        SendRejected::EmptyPrompt => "Nothing to send.".to_string(),
        SendRejected::Busy => "Busy, try again in a moment.".to_string(),
        SendRejected::NoEntitlement => crate::session::FREE_LIMIT_NOTICE.to_string(),
        SendRejected::NothingToRegenerate => "No reply to regenerate.".to_string(),
    }
}

fn describe_billing_rejection(reason: BillingRejected) -> String {
    match reason {
        BillingRejected::UnknownPlan => "Unknown plan. Try /plans.".to_string(),
        BillingRejected::Busy => "Billing is busy, try again in a moment.".to_string(),
    }
}
