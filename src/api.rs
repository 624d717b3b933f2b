use crate::error::{ApiError, ApiResult};
use crate::models::ModelList;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Header names shared with the backend
pub const HDR_CLIENT_ID: &str = "x-void-client-id";
pub const HDR_PRO_TOKEN: &str = "x-void-pro-token";
pub const HDR_FINGERPRINT: &str = "x-void-fingerprint";
pub const HDR_FREE_LEFT: &str = "x-free-left";
pub const HDR_PRO_LEFT: &str = "x-pro-left";
pub const HDR_RETRY_AFTER: &str = "retry-after";

// Alias for the raw body stream of a generation
pub type ByteStream = Pin<Box<dyn Stream<Item = ApiResult<Bytes>> + Send>>;

/// Identity and entitlement attached to a generation request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub client_id: String,
    pub pro_token: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
}

/// Entitlement counters a response may carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub free_left: Option<u64>,
    pub pro_left: Option<u64>,
}

/// Response of the generation endpoint. Any status is returned as-is so the
/// caller sees the counters and the retry hint even on 402 or 429.
pub struct ChatResponse {
    pub status: u16,
    pub counters: UsageCounters,
    pub retry_after: Option<String>,
    pub body: ByteStream,
}

/// Outcome of a token status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProStatusReply {
    NotFound,
    Unauthorized,
    Failed(u16),
    Ok { credits_left: Option<u64> },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub amount: String,
    pub currency: String,
    pub credits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInvoice {
    pub invoice_id: String,
    pub checkout_link: Option<String>,
}

/// Body of a claim attempt: by invoice, or by plan when no invoice id is known.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ClaimRequest {
    #[serde(rename_all = "camelCase")]
    Invoice { invoice_id: String },
    #[serde(rename_all = "camelCase")]
    Plan {
        plan_id: String,
        amount: String,
        currency: String,
        credits: u64,
    },
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimReply {
    Pending,
    AlreadyClaimed,
    Token(String),
    Failed(u16),
}

// Trait defining the backend contract
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn open_chat_stream(
        &self,
        credentials: &Credentials,
        request: &ChatRequest,
    ) -> ApiResult<ChatResponse>;

    async fn pro_status(&self, token: &str) -> ApiResult<ProStatusReply>;

    async fn create_invoice(&self, request: &InvoiceRequest) -> ApiResult<CreatedInvoice>;

    async fn claim(&self, request: &ClaimRequest) -> ApiResult<ClaimReply>;

    async fn list_models(&self) -> ApiResult<ModelList>;
}

// --- HTTP implementation ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InvoiceReplyBody {
    #[serde(default)]
    invoice_id: Option<String>,
    #[serde(default)]
    checkout_link: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ClaimReplyBody {
    #[serde(default)]
    token: Option<String>,
}

pub struct HttpBackend {
    client: Client,
    base: String,
}

impl HttpBackend {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base: crate::config::normalize_base(&base.into()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn open_chat_stream(
        &self,
        credentials: &Credentials,
        request: &ChatRequest,
    ) -> ApiResult<ChatResponse> {
        log::info!(
            "Opening generation stream at {} with {} messages",
            self.url("/chat/stream"),
            request.messages.len()
        );

        let mut builder = self
            .client
            .post(self.url("/chat/stream"))
            .header(HDR_CLIENT_ID, &credentials.client_id)
            .json(request);
        if let Some(token) = credentials.pro_token.as_deref() {
            builder = builder.header(HDR_PRO_TOKEN, token);
        }
        if let Some(fp) = credentials.fingerprint.as_deref().filter(|f| !f.is_empty()) {
            builder = builder.header(HDR_FINGERPRINT, fp);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let counters = UsageCounters {
            free_left: parse_counter(headers, HDR_FREE_LEFT),
            pro_left: parse_counter(headers, HDR_PRO_LEFT),
        };
        let retry_after = headers
            .get(HDR_RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        log::info!("Generation stream answered with status {}", status);

        let body = response.bytes_stream().map(|chunk| chunk.map_err(ApiError::from));

        Ok(ChatResponse {
            status,
            counters,
            retry_after,
            body: Box::pin(body),
        })
    }

    async fn pro_status(&self, token: &str) -> ApiResult<ProStatusReply> {
        log::debug!("Querying pro status for token {}", crate::identity::short_id(token));
        let response = self
            .client
            .get(self.url("/pro/status"))
            .header(HDR_PRO_TOKEN, token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ProStatusReply::NotFound);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Ok(ProStatusReply::Unauthorized);
        }
        if !status.is_success() {
            return Ok(ProStatusReply::Failed(status.as_u16()));
        }

        let header_left = parse_counter(response.headers(), HDR_PRO_LEFT);
        let text = response.text().await?;
        // A body that is not JSON simply carries no credits field
        let body_left = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|json| json.get("credits_left").and_then(|v| v.as_f64()))
            .and_then(clamp_counter);

        Ok(ProStatusReply::Ok {
            credits_left: body_left.or(header_left),
        })
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> ApiResult<CreatedInvoice> {
        log::info!(
            "Creating invoice for {} credits ({} {})",
            request.credits,
            request.amount,
            request.currency
        );
        let response = self
            .client
            .post(self.url("/pro/create-invoice"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Invoice creation failed with status {}: {}", status, body);
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let reply: InvoiceReplyBody = serde_json::from_str(&text)?;
        let invoice_id = reply
            .invoice_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingField("invoiceId"))?;
        let checkout_link = reply
            .checkout_link
            .map(|link| link.trim().to_string())
            .filter(|link| !link.is_empty());

        Ok(CreatedInvoice {
            invoice_id,
            checkout_link,
        })
    }

    async fn claim(&self, request: &ClaimRequest) -> ApiResult<ClaimReply> {
        let response = self
            .client
            .post(self.url("/pro/claim"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        log::debug!("Claim attempt answered with status {}", status);
        match status {
            StatusCode::NOT_FOUND => return Ok(ClaimReply::Pending),
            StatusCode::CONFLICT => return Ok(ClaimReply::AlreadyClaimed),
            s if !s.is_success() => return Ok(ClaimReply::Failed(s.as_u16())),
            _ => {}
        }

        let text = response.text().await?;
        let reply: ClaimReplyBody = serde_json::from_str(&text)?;
        reply
            .token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(ClaimReply::Token)
            .ok_or(ApiError::MissingField("token"))
    }

    async fn list_models(&self) -> ApiResult<ModelList> {
        let response = self.client.get(self.url("/models")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Reads a numeric counter header. Non-numeric values are ignored and
/// negative ones clamp to zero.
pub fn parse_counter(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(clamp_counter)
}

fn clamp_counter(value: f64) -> Option<u64> {
    if value.is_finite() {
        Some(value.max(0.0) as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn counters_parse_and_clamp() {
        let mut headers = HeaderMap::new();
        headers.insert(HDR_FREE_LEFT, HeaderValue::from_static("3"));
        headers.insert(HDR_PRO_LEFT, HeaderValue::from_static("-2"));
        assert_eq!(parse_counter(&headers, HDR_FREE_LEFT), Some(3));
        assert_eq!(parse_counter(&headers, HDR_PRO_LEFT), Some(0));

        headers.insert(HDR_FREE_LEFT, HeaderValue::from_static("lots"));
        assert_eq!(parse_counter(&headers, HDR_FREE_LEFT), None);
        assert_eq!(parse_counter(&headers, "x-missing"), None);
    }

    #[test]
    fn claim_request_shapes() {
        let by_invoice = ClaimRequest::Invoice {
            invoice_id: "inv_1".into(),
        };
        assert_eq!(
            serde_json::to_value(&by_invoice).unwrap(),
            serde_json::json!({"invoiceId": "inv_1"})
        );

        let by_plan = ClaimRequest::Plan {
            plan_id: "plus".into(),
            amount: "4".into(),
            currency: "USD".into(),
            credits: 5000,
        };
        assert_eq!(
            serde_json::to_value(&by_plan).unwrap(),
            serde_json::json!({"planId": "plus", "amount": "4", "currency": "USD", "credits": 5000})
        );
    }

    #[test]
    fn chat_request_omits_missing_model() {
        let request = ChatRequest {
            model: None,
            messages: vec![],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"messages": []})
        );
    }
}
