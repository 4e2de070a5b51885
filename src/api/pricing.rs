// src/api/pricing.rs

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::{db, AppState};

#[derive(Debug, Deserialize)]
pub struct PricingQuery {
    /// Monthly | Yearly; без параметра — оба цикла.
    pub billing_cycle: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/get-pricing",
    tag = "pricing",
    responses(
        (status = 200, description = "Активные подписочные тарифы", body = Vec<crate::models::PricingPlan>)
    ),
    security(("bearer_auth" = []))
)]
#[get("/get-pricing")]
pub async fn get_pricing(
    state: web::Data<AppState>,
    query: web::Query<PricingQuery>,
) -> impl Responder {
    let cycle = match query.billing_cycle.as_deref() {
        None => None,
        Some(c @ ("Monthly" | "Yearly")) => Some(c),
        Some(other) => {
            return HttpResponse::BadRequest()
                .json(json!({ "error": format!("invalid billing_cycle: {other}") }));
        }
    };

    match db::list_subscription_pricing(&state.pool, cycle).await {
        Ok(plans) => HttpResponse::Ok().json(plans),
        Err(e) => {
            log::error!("list_subscription_pricing error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/get-coin-pricing",
    tag = "pricing",
    responses(
        (status = 200, description = "Разовые паки монет", body = Vec<crate::models::PricingPlan>)
    ),
    security(("bearer_auth" = []))
)]
#[get("/get-coin-pricing")]
pub async fn get_coin_pricing(state: web::Data<AppState>) -> impl Responder {
    match db::list_coin_pricing(&state.pool).await {
        Ok(plans) => HttpResponse::Ok().json(plans),
        Err(e) => {
            log::error!("list_coin_pricing error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/get-promo",
    tag = "pricing",
    responses(
        (status = 200, description = "Список промокодов", body = Vec<crate::models::PromoManagement>)
    ),
    security(("bearer_auth" = []))
)]
#[get("/get-promo")]
pub async fn get_promo(state: web::Data<AppState>) -> impl Responder {
    match db::list_promos(&state.pool).await {
        Ok(promos) => HttpResponse::Ok().json(promos),
        Err(e) => {
            log::error!("list_promos error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyPromoRequest {
    pub coupon: String,
}

#[utoipa::path(
    post,
    path = "/api/verify-promo",
    tag = "pricing",
    request_body = VerifyPromoRequest,
    responses(
        (status = 200, description = "Результат проверки купона")
    ),
    security(("bearer_auth" = []))
)]
#[post("/verify-promo")]
pub async fn verify_promo(
    state: web::Data<AppState>,
    payload: web::Json<VerifyPromoRequest>,
) -> impl Responder {
    let promo = match db::get_promo_by_coupon(&state.pool, &payload.coupon).await {
        Ok(p) => p,
        Err(e) => {
            log::error!("get_promo_by_coupon error: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let Some(promo) = promo else {
        return HttpResponse::Ok().json(json!({ "valid": false, "reason": "not found" }));
    };

    if !db::promo_is_active(&promo, Utc::now()) {
        return HttpResponse::Ok().json(json!({ "valid": false, "reason": "inactive or expired" }));
    }

    HttpResponse::Ok().json(json!({
        "valid": true,
        "coupon": promo.coupon,
        "percent_off": promo.percent_off,
    }))
}
