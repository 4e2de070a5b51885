// src/api/wallet.rs

use actix_web::web::ReqData;
use actix_web::{get, web, HttpResponse, Responder};
use serde_json::json;

use crate::billing::costs::Feature;
use crate::{db, AppState};

#[utoipa::path(
    get,
    path = "/api/get-user-coin",
    tag = "wallet",
    responses(
        (status = 200, description = "Текущий баланс", body = crate::models::UserWallet),
        (status = 404, description = "Кошелёк ещё не создан")
    ),
    security(("bearer_auth" = []))
)]
#[get("/get-user-coin")]
pub async fn get_user_coin(state: web::Data<AppState>, user_id: ReqData<i64>) -> impl Responder {
    let user_id = user_id.into_inner();

    match db::get_wallet(&state.pool, user_id).await {
        Ok(Some(wallet)) => HttpResponse::Ok().json(wallet),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "wallet not found" })),
        Err(e) => {
            log::error!("get_wallet error: {e} user_id={user_id}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/coin-cost",
    tag = "wallet",
    responses(
        (status = 200, description = "Стоимость фич в монетах")
    ),
    security(("bearer_auth" = []))
)]
#[get("/coin-cost")]
pub async fn coin_cost(state: web::Data<AppState>) -> impl Responder {
    let mut costs = serde_json::Map::new();
    for feature in [Feature::Chat, Feature::Image, Feature::Video, Feature::Character] {
        match state.costs.cost_of(feature) {
            Ok(cost) => {
                costs.insert(feature.as_str().to_string(), json!(cost));
            }
            Err(e) => {
                log::error!("coin_cost error: {e}");
                return HttpResponse::InternalServerError()
                    .json(json!({ "error": "cost config unavailable" }));
            }
        }
    }

    HttpResponse::Ok().json(costs)
}
