// src/api/checkout.rs

use actix_web::web::ReqData;
use actix_web::{post, web, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::stripe_client::CheckoutSessionRequest;
use crate::{db, AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCheckoutRequest {
    /// pricing_plan.pricing_id (price ref платёжного провайдера)
    pub pricing_id: String,
    pub promo_code: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// Создаёт Checkout Session и фиксирует pending-заказ.
/// Заказ закроет вебхук checkout.session.completed, не этот хендлер.
#[utoipa::path(
    post,
    path = "/api/create-checkout-session",
    tag = "checkout",
    request_body = CreateCheckoutRequest,
    responses(
        (status = 200, description = "Ссылка на оплату"),
        (status = 400, description = "Неизвестный тариф или промокод")
    ),
    security(("bearer_auth" = []))
)]
#[post("/create-checkout-session")]
pub async fn create_checkout_session(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<CreateCheckoutRequest>,
) -> impl Responder {
    let user_id = user_id.into_inner();

    // 1) пользователь и тариф
    let user = match db::get_user(&state.pool, user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => return HttpResponse::BadRequest().json(json!({ "error": "user not found" })),
        Err(e) => {
            log::error!("get_user error: {e} user_id={user_id}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let pricing = match db::get_pricing_by_ref(&state.pool, &payload.pricing_id).await {
        Ok(Some(p)) if p.status == "Active" => p,
        Ok(_) => return HttpResponse::BadRequest().json(json!({ "error": "invalid pricing" })),
        Err(e) => {
            log::error!("get_pricing_by_ref error: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    // 2) customer у провайдера: берём сохранённый или создаём
    let customer_ref = match user.payment_customer_id.clone() {
        Some(c) => c,
        None => {
            let created = match state
                .stripe
                .create_customer(&user.email, user.username.as_deref())
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    log::error!("create_customer error: {e} user_id={user_id}");
                    return HttpResponse::BadGateway()
                        .json(json!({ "error": "payment provider unavailable" }));
                }
            };

            if let Err(e) = sqlx::query("UPDATE users SET payment_customer_id = $1 WHERE id = $2")
                .bind(&created)
                .bind(user_id)
                .execute(&state.pool)
                .await
            {
                log::error!("store customer ref error: {e} user_id={user_id}");
                return HttpResponse::InternalServerError().finish();
            }
            created
        }
    };

    // 3) промокод, если передан
    let mut promo = None;
    if let Some(code) = payload.promo_code.as_deref() {
        match db::get_promo_by_coupon(&state.pool, code).await {
            Ok(Some(p)) if db::promo_is_active(&p, Utc::now()) => promo = Some(p),
            Ok(_) => {
                return HttpResponse::BadRequest().json(json!({ "error": "invalid promo code" }))
            }
            Err(e) => {
                log::error!("get_promo_by_coupon error: {e}");
                return HttpResponse::InternalServerError().finish();
            }
        }
    }

    let subtotal: f64 = pricing.price.parse().unwrap_or(0.0);
    let discount = promo
        .as_ref()
        .and_then(|p| p.percent_off.parse::<f64>().ok())
        .map(|pct| subtotal * pct / 100.0)
        .unwrap_or(0.0);

    // 4) pending-заказ до ухода на оплату
    let order_id = match db::insert_pending_order(
        &state.pool,
        user_id,
        &customer_ref,
        promo.as_ref().map(|p| p.id),
        promo.as_ref().map(|p| p.coupon.as_str()),
        promo.as_ref().map(|p| p.discount_type.as_str()),
        &format!("{discount:.2}"),
        &format!("{subtotal:.2}"),
        &pricing.currency,
    )
    .await
    {
        Ok(id) => id,
        Err(e) => {
            log::error!("insert_pending_order error: {e} user_id={user_id}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    // 5) сессия у провайдера
    let mode = if pricing.billing_cycle == "One Time" {
        "payment"
    } else {
        "subscription"
    };
    let success_url = payload
        .success_url
        .clone()
        .unwrap_or_else(|| std::env::var("CHECKOUT_SUCCESS_URL").unwrap_or_default());
    let cancel_url = payload
        .cancel_url
        .clone()
        .unwrap_or_else(|| std::env::var("CHECKOUT_CANCEL_URL").unwrap_or_default());

    log::info!(
        "create checkout session user_id={} pricing_id={} mode={} promo={:?}",
        user_id,
        pricing.pricing_id,
        mode,
        promo.as_ref().map(|p| p.coupon.as_str())
    );

    let session = match state
        .stripe
        .create_checkout_session(CheckoutSessionRequest {
            mode: mode.to_string(),
            customer_ref,
            price_ref: pricing.pricing_id.clone(),
            success_url,
            cancel_url,
            promotion_ref: promo.as_ref().and_then(|p| p.stripe_promotion_id.clone()),
        })
        .await
    {
        Ok(s) => s,
        Err(e) => {
            log::error!("create_checkout_session error: {e} user_id={user_id}");
            return HttpResponse::BadGateway().json(json!({
                "error": "checkout session create failed",
                "details": e.to_string()
            }));
        }
    };

    HttpResponse::Ok().json(json!({
        "order_id": order_id,
        "session_id": session.session_id,
        "url": session.url,
    }))
}
