// src/api/webhooks.rs
//
// Приём событий платёжного провайдера. Контракт со Stripe по ответам:
// 2xx — доставлено (даже если локально применить нечего), ретраев не будет;
// 400 — битая подпись; 5xx — временная ошибка, Stripe перешлёт событие:
// reconcile снимает маркер processed_events перед ошибкой, и повтор
// обрабатывается заново, не задваивая начисления.

use actix_web::{post, web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;

use crate::billing::events::{parse_checkout_session, parse_subscription_object, StripeEvent};
use crate::billing::reconcile::{
    reconcile_one_time_checkout, reconcile_subscription_change, reconcile_subscription_checkout,
    OneTimeCheckout, Outcome, SubscriptionChange, SubscriptionCheckout,
};
use crate::billing::signature;
use crate::billing::store::PgStore;
use crate::billing::BillingError;
use crate::AppState;

#[utoipa::path(
    post,
    path = "/webhooks/stripe",
    tag = "webhooks",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Событие принято"),
        (status = 400, description = "Невалидная подпись"),
        (status = 500, description = "Временная ошибка, событие будет переслано")
    )
)]
#[post("/webhooks/stripe")]
pub async fn stripe_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> impl Responder {
    // 1) Подпись до любого разбора тела
    let sig_header = req
        .headers()
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if let Err(e) = signature::verify(
        &state.stripe_webhook_key,
        &body,
        sig_header,
        Utc::now().timestamp(),
    ) {
        log::warn!("stripe webhook signature rejected: {e}");
        return HttpResponse::BadRequest().json(json!({ "error": "invalid signature" }));
    }

    // 2) Битый JSON — постоянная ошибка, подтверждаем чтобы остановить ретраи
    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(ev) => ev,
        Err(e) => {
            log::warn!("stripe webhook malformed payload: {e}");
            return HttpResponse::Ok().json(json!({ "received": true, "error": "malformed payload" }));
        }
    };

    log::info!("stripe webhook received id={} type={}", event.id, event.event_type);
    let store = PgStore::new(state.pool.clone());

    let outcome = match event.event_type.as_str() {
        "checkout.session.completed" => {
            let Some(session) = parse_checkout_session(&event.data.object) else {
                log::warn!("checkout session without id, event_id={}", event.id);
                return HttpResponse::Ok().json(json!({ "received": true, "error": "malformed session" }));
            };

            if session.mode == "payment" {
                // Тариф берём из строк сессии — в самой сессии price отсутствует
                let price_ref = match state.stripe.session_line_price(&session.session_id).await {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("session_line_price error: {e} event_id={}", event.id);
                        return HttpResponse::InternalServerError().finish();
                    }
                };

                reconcile_one_time_checkout(
                    &store,
                    OneTimeCheckout {
                        event_id: event.id.clone(),
                        customer_ref: session.customer,
                        email: session.email,
                        price_ref,
                        settlement_ref: session.payment_intent,
                    },
                )
                .await
            } else {
                let Some(subscription_ref) = session.subscription else {
                    log::warn!("subscription checkout without subscription, event_id={}", event.id);
                    return HttpResponse::Ok()
                        .json(json!({ "received": true, "error": "session without subscription" }));
                };

                // Инлайновый объект неполный, периоды и тариф даёт живой запрос
                let live = match state.stripe.retrieve_subscription(&subscription_ref).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("retrieve_subscription error: {e} event_id={}", event.id);
                        return HttpResponse::InternalServerError().finish();
                    }
                };
                let Some(obj) = parse_subscription_object(&live) else {
                    log::error!("unparseable live subscription, event_id={}", event.id);
                    return HttpResponse::InternalServerError().finish();
                };

                reconcile_subscription_checkout(
                    &store,
                    SubscriptionCheckout {
                        event_id: event.id.clone(),
                        customer_ref: obj.customer.or(session.customer),
                        email: session.email,
                        subscription_ref: obj.id,
                        price_ref: obj.price_id,
                        current_period_start: obj.current_period_start,
                        current_period_end: obj.current_period_end,
                        latest_invoice: obj.latest_invoice,
                    },
                )
                .await
            }
        }
        event_type @ ("customer.subscription.updated" | "customer.subscription.deleted") => {
            let Some(obj) = parse_subscription_object(&event.data.object) else {
                log::warn!("subscription event without id, event_id={}", event.id);
                return HttpResponse::Ok()
                    .json(json!({ "received": true, "error": "malformed subscription" }));
            };

            let status = if event_type == "customer.subscription.deleted" {
                obj.status.or_else(|| Some("canceled".to_string()))
            } else {
                obj.status
            };

            reconcile_subscription_change(
                &store,
                SubscriptionChange {
                    event_id: event.id.clone(),
                    customer_ref: obj.customer,
                    subscription_ref: obj.id,
                    status,
                    price_ref: obj.price_id,
                    price_nickname: obj.price_nickname,
                    current_period_start: obj.current_period_start,
                    current_period_end: obj.current_period_end,
                    latest_invoice: obj.latest_invoice,
                },
                Utc::now(),
            )
            .await
        }
        other => {
            log::debug!("stripe webhook ignored type={other} event_id={}", event.id);
            return HttpResponse::Ok().json(json!({ "received": true, "ignored": other }));
        }
    };

    match outcome {
        Ok(Outcome::Processed) => {
            HttpResponse::Ok().json(json!({ "received": true, "status": "processed" }))
        }
        Ok(Outcome::AlreadyProcessed) => {
            HttpResponse::Ok().json(json!({ "received": true, "status": "already_processed" }))
        }
        Ok(Outcome::Skipped(reason)) => {
            HttpResponse::Ok().json(json!({ "received": true, "status": "skipped", "reason": reason }))
        }
        Err(BillingError::Db(e)) => {
            log::error!("stripe webhook db error: {e} event_id={}", event.id);
            HttpResponse::InternalServerError().finish()
        }
        Err(e) => {
            log::error!("stripe webhook billing error: {e} event_id={}", event.id);
            HttpResponse::InternalServerError().finish()
        }
    }
}
