// src/api/admin.rs

use actix_web::web::ReqData;
use actix_web::{post, web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::{db, AppState};

async fn require_admin(state: &AppState, user_id: i64) -> Result<(), HttpResponse> {
    match db::get_user(&state.pool, user_id).await {
        Ok(Some(user)) if user.role.eq_ignore_ascii_case("admin") => Ok(()),
        Ok(_) => Err(HttpResponse::Forbidden().json(json!({ "error": "admin only" }))),
        Err(e) => {
            log::error!("require_admin db error: {e} user_id={user_id}");
            Err(HttpResponse::InternalServerError().finish())
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AppConfigRequest {
    pub parameter_name: String,
    pub parameter_value: String,
}

/// Пишет параметр и сразу перечитывает кеш: новая стоимость действует
/// со следующего запроса, без рестарта.
#[utoipa::path(
    post,
    path = "/api/admin/app-config",
    tag = "admin",
    request_body = AppConfigRequest,
    responses(
        (status = 200, description = "Параметр сохранён, кеш обновлён"),
        (status = 403, description = "Не админ")
    ),
    security(("bearer_auth" = []))
)]
#[post("/admin/app-config")]
pub async fn set_app_config(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<AppConfigRequest>,
) -> impl Responder {
    let user_id = user_id.into_inner();
    if let Err(resp) = require_admin(&state, user_id).await {
        return resp;
    }

    if let Err(e) =
        db::upsert_app_config(&state.pool, &payload.parameter_name, &payload.parameter_value).await
    {
        log::error!("upsert_app_config error: {e}");
        return HttpResponse::InternalServerError().finish();
    }

    if let Err(e) = state.costs.load(&state.pool).await {
        log::error!("cost cache reload error: {e}");
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "saved, but cache reload failed" }));
    }

    log::info!(
        "app config updated by user_id={} parameter={}",
        user_id,
        payload.parameter_name
    );
    HttpResponse::Ok().json(json!({ "updated": payload.parameter_name }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PricingUpsertRequest {
    pub plan_name: String,
    pub pricing_id: String,
    pub currency: String,
    pub price: String,
    pub coin_reward: i64,
    pub billing_cycle: String, // Monthly | Yearly | One Time
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/api/admin/pricing",
    tag = "admin",
    request_body = PricingUpsertRequest,
    responses(
        (status = 200, description = "Тариф создан или обновлён"),
        (status = 403, description = "Не админ")
    ),
    security(("bearer_auth" = []))
)]
#[post("/admin/pricing")]
pub async fn upsert_pricing(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<PricingUpsertRequest>,
) -> impl Responder {
    let user_id = user_id.into_inner();
    if let Err(resp) = require_admin(&state, user_id).await {
        return resp;
    }

    if !matches!(payload.billing_cycle.as_str(), "Monthly" | "Yearly" | "One Time") {
        return HttpResponse::BadRequest().json(json!({ "error": "invalid billing_cycle" }));
    }
    if payload.price.parse::<f64>().is_err() {
        return HttpResponse::BadRequest().json(json!({ "error": "invalid price" }));
    }

    match db::upsert_pricing(
        &state.pool,
        &payload.plan_name,
        &payload.pricing_id,
        &payload.currency,
        &payload.price,
        payload.coin_reward,
        &payload.billing_cycle,
        &payload.status,
    )
    .await
    {
        Ok(id) => {
            log::info!(
                "pricing upserted by user_id={} pricing_id={}",
                user_id,
                payload.pricing_id
            );
            HttpResponse::Ok().json(json!({ "id": id, "pricing_id": payload.pricing_id }))
        }
        Err(e) => {
            log::error!("upsert_pricing error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
