// src/api/subscriptions.rs

use actix_web::web::ReqData;
use actix_web::{get, web, HttpResponse, Responder};
use serde_json::json;

use crate::{db, AppState};

#[utoipa::path(
    get,
    path = "/api/subscription-status",
    tag = "subscriptions",
    responses(
        (status = 200, description = "Текущая подписка пользователя")
    ),
    security(("bearer_auth" = []))
)]
#[get("/subscription-status")]
pub async fn subscription_status(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
) -> impl Responder {
    let user_id = user_id.into_inner();

    match db::get_latest_subscription(&state.pool, user_id).await {
        Ok(Some(sub)) => HttpResponse::Ok().json(json!({
            "status": sub.status,
            "plan_name": sub.plan_name,
            "price_id": sub.price_id,
            "current_period_end": sub.current_period_end,
            "total_coins_rewarded": sub.total_coins_rewarded,
        })),
        Ok(None) => HttpResponse::Ok().json(json!({ "status": "none" })),
        Err(e) => {
            log::error!("get_latest_subscription error: {e} user_id={user_id}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
