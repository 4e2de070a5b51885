// src/stripe_client.rs
//
// Минимальный клиент Stripe API (https://api.stripe.com)
// Авторизация: Bearer secret key, тело запросов — form-encoded.

use std::fmt;

use serde_json::Value;

const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug)]
pub enum StripeError {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    InvalidResponse(String),
}

impl fmt::Display for StripeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StripeError::Http(e) => write!(f, "http error: {e}"),
            StripeError::Api { status, body } => {
                write!(f, "stripe api error status={status} body={body}")
            }
            StripeError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl From<reqwest::Error> for StripeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub mode: String, // payment | subscription
    pub customer_ref: String,
    pub price_ref: String,
    pub success_url: String,
    pub cancel_url: String,
    pub promotion_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            base_url: STRIPE_API_BASE.to_string(),
        }
    }

    /// Для тестов против локальной заглушки.
    pub fn with_base_url(secret_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            base_url,
        }
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<Value, StripeError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await?;

        Self::into_json(resp).await
    }

    async fn get(&self, path: &str) -> Result<Value, StripeError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        Self::into_json(resp).await
    }

    async fn into_json(resp: reqwest::Response) -> Result<Value, StripeError> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(StripeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| StripeError::InvalidResponse(format!("{e}; body={body}")))
    }

    pub async fn create_customer(&self, email: &str, name: Option<&str>) -> Result<String, StripeError> {
        let mut form = vec![("email".to_string(), email.to_string())];
        if let Some(name) = name {
            form.push(("name".to_string(), name.to_string()));
        }

        let body = self.post_form("/v1/customers", &form).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StripeError::InvalidResponse("customer without id".to_string()))
    }

    pub async fn create_checkout_session(
        &self,
        req: CheckoutSessionRequest,
    ) -> Result<CheckoutSessionResponse, StripeError> {
        let mut form = vec![
            ("mode".to_string(), req.mode),
            ("customer".to_string(), req.customer_ref),
            ("line_items[0][price]".to_string(), req.price_ref),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), req.success_url),
            ("cancel_url".to_string(), req.cancel_url),
        ];
        if let Some(promotion_ref) = req.promotion_ref {
            form.push(("discounts[0][promotion_code]".to_string(), promotion_ref));
        }

        let body = self.post_form("/v1/checkout/sessions", &form).await?;
        let session_id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StripeError::InvalidResponse("session without id".to_string()))?;

        Ok(CheckoutSessionResponse {
            session_id,
            url: body.get("url").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Живой объект подписки — источник правды для периодов и тарифа;
    /// разбирается через billing::events::parse_subscription_object.
    pub async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Value, StripeError> {
        self.get(&format!("/v1/subscriptions/{subscription_ref}")).await
    }

    /// Price первой строки оплаченной сессии (для разовых покупок монет).
    pub async fn session_line_price(&self, session_id: &str) -> Result<Option<String>, StripeError> {
        let body = self
            .get(&format!("/v1/checkout/sessions/{session_id}/line_items?limit=1"))
            .await?;

        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|item| item.get("price"))
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
