// src/billing/events.rs
//
// Конверт событий платёжного провайдера и нормализация сырых payload'ов.
// Stripe не гарантирует ни порядок доставки, ни состав таймстемпов —
// отсутствующие current_period_* трактуем как None, событие не роняем.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// checkout.session.completed: поля сессии, которые нужны сверке.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub mode: String, // payment | subscription
    pub customer: Option<String>,
    pub email: Option<String>,
    pub subscription: Option<String>,
    pub payment_intent: Option<String>,
}

pub fn parse_checkout_session(object: &Value) -> Option<CheckoutSession> {
    let session_id = object.get("id")?.as_str()?.to_string();
    let mode = object
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("subscription")
        .to_string();
    let email = object
        .get("customer_email")
        .and_then(Value::as_str)
        .or_else(|| object.get("email").and_then(Value::as_str))
        .map(str::to_string);

    Some(CheckoutSession {
        session_id,
        mode,
        customer: str_field(object, "customer"),
        email,
        subscription: str_field(object, "subscription"),
        payment_intent: str_field(object, "payment_intent"),
    })
}

/// Объект подписки: общий для inline-payload'а subscription.updated/deleted
/// и для ответа GET /v1/subscriptions/{id}.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Option<String>,
    pub status: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub price_id: Option<String>,
    pub price_nickname: Option<String>,
    pub latest_invoice: Option<String>,
}

pub fn parse_subscription_object(object: &Value) -> Option<SubscriptionObject> {
    let id = object.get("id")?.as_str()?.to_string();

    let price = object
        .get("items")
        .and_then(|v| v.get("data"))
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|item| item.get("price"));

    Some(SubscriptionObject {
        id,
        customer: str_field(object, "customer"),
        status: str_field(object, "status"),
        current_period_start: ts_field(object, "current_period_start"),
        current_period_end: ts_field(object, "current_period_end"),
        price_id: price.and_then(|p| p.get("id")).and_then(Value::as_str).map(str::to_string),
        price_nickname: price
            .and_then(|p| p.get("nickname"))
            .and_then(Value::as_str)
            .map(str::to_string),
        latest_invoice: str_field(object, "latest_invoice"),
    })
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn ts_field(object: &Value, key: &str) -> Option<DateTime<Utc>> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}
