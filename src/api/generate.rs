// src/api/generate.rs
//
// Платные генерации. Порядок фиксированный: guard по балансу -> генерация ->
// списание. Неудачная генерация не тарифицируется; гонку двух параллельных
// запросов закрывает условный декремент при списании.

use actix_web::web::ReqData;
use actix_web::{post, web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::billing::costs::Feature;
use crate::billing::store::PgStore;
use crate::billing::wallet::{authorize, debit, Payer};
use crate::billing::BillingError;
use crate::inference::MediaKind;
use crate::{db, s3_utils, AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub message: String,
    pub character_prompt: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MediaRequest {
    pub prompt: String,
}

async fn resolve_payer(state: &AppState, user_id: i64) -> Result<Payer, HttpResponse> {
    match db::get_user(&state.pool, user_id).await {
        Ok(Some(user)) => Ok(Payer::for_role(user.id, &user.role)),
        Ok(None) => Err(HttpResponse::Unauthorized().json(json!({ "error": "unknown user" }))),
        Err(e) => {
            log::error!("get_user error: {e} user_id={user_id}");
            Err(HttpResponse::InternalServerError().finish())
        }
    }
}

fn billing_error_response(e: BillingError) -> HttpResponse {
    match e {
        BillingError::InsufficientCoins => {
            HttpResponse::PaymentRequired().json(json!({ "error": "Insufficient coins" }))
        }
        BillingError::CostCacheNotLoaded => {
            log::error!("cost cache not loaded");
            HttpResponse::InternalServerError().json(json!({ "error": "cost config unavailable" }))
        }
        BillingError::Db(e) => {
            log::error!("billing db error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/generate-chat",
    tag = "generate",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Ответ персонажа"),
        (status = 402, description = "Недостаточно монет")
    ),
    security(("bearer_auth" = []))
)]
#[post("/generate-chat")]
pub async fn generate_chat(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<ChatRequest>,
) -> impl Responder {
    let user_id = user_id.into_inner();
    let store = PgStore::new(state.pool.clone());

    let payer = match resolve_payer(&state, user_id).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = authorize(&store, &state.costs, payer, Feature::Chat).await {
        return billing_error_response(e);
    }

    let reply = match state
        .inference
        .generate_chat(payload.character_prompt.as_deref(), &payload.message)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            log::error!("generate_chat inference error: {e} user_id={user_id}");
            return HttpResponse::BadGateway().json(json!({ "error": "generation failed" }));
        }
    };

    let coins_charged = match debit(&store, &state.costs, payer, Feature::Chat).await {
        Ok(c) => c,
        Err(e) => return billing_error_response(e),
    };

    HttpResponse::Ok().json(json!({
        "reply": reply,
        "coins_charged": coins_charged,
    }))
}

async fn generate_media(
    state: &AppState,
    user_id: i64,
    kind: MediaKind,
    feature: Feature,
    prompt: &str,
) -> HttpResponse {
    let store = PgStore::new(state.pool.clone());

    let payer = match resolve_payer(state, user_id).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    if let Err(e) = authorize(&store, &state.costs, payer, feature).await {
        return billing_error_response(e);
    }

    let poll_interval = match state.costs.int_value("GENERATION_POLL_INTERVAL_SECS", 5) {
        Ok(v) => v.max(1) as u64,
        Err(e) => return billing_error_response(e),
    };
    let max_wait = match state.costs.int_value("GENERATION_MAX_WAIT_SECS", 300) {
        Ok(v) => v.max(1) as u64,
        Err(e) => return billing_error_response(e),
    };

    let task_id = match state.inference.start_media_task(kind, prompt).await {
        Ok(id) => id,
        Err(e) => {
            log::error!("start_media_task error: {e} user_id={user_id} kind={}", kind.as_str());
            return HttpResponse::BadGateway().json(json!({ "error": "generation failed" }));
        }
    };

    let result_url = match state
        .inference
        .wait_for_media(&task_id, poll_interval, max_wait)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            log::error!(
                "wait_for_media error: {e} user_id={user_id} task_id={task_id}"
            );
            return HttpResponse::BadGateway().json(json!({ "error": "generation failed" }));
        }
    };

    let (ext, content_type) = match kind {
        MediaKind::Video => ("mp4", "video/mp4"),
        MediaKind::Image | MediaKind::Character => ("png", "image/png"),
    };
    let key = format!("{}/{}.{}", kind.as_str(), Uuid::new_v4(), ext);

    let public_url = match s3_utils::archive_media(
        &state.s3_client,
        &state.s3_bucket,
        &state.s3_public_base_url,
        &result_url,
        &key,
        content_type,
    )
    .await
    {
        Ok(url) => url,
        Err(e) => {
            log::error!("archive_media error: {e} user_id={user_id} task_id={task_id}");
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "media archive failed" }));
        }
    };

    let coins_charged = match debit(&store, &state.costs, payer, feature).await {
        Ok(c) => c,
        Err(e) => return billing_error_response(e),
    };

    let media_id = match db::insert_media(
        &state.pool,
        user_id,
        kind.as_str(),
        Some(&public_url),
        coins_charged,
    )
    .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            // Монеты уже списаны, медиа доступно — не валим ответ из-за каталога.
            log::error!("insert_media error: {e} user_id={user_id}");
            None
        }
    };

    HttpResponse::Ok().json(json!({
        "url": public_url,
        "media_id": media_id,
        "coins_charged": coins_charged,
    }))
}

#[utoipa::path(
    post,
    path = "/api/generate-image",
    tag = "generate",
    request_body = MediaRequest,
    responses(
        (status = 200, description = "Сгенерированное изображение"),
        (status = 402, description = "Недостаточно монет")
    ),
    security(("bearer_auth" = []))
)]
#[post("/generate-image")]
pub async fn generate_image(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<MediaRequest>,
) -> impl Responder {
    generate_media(
        &state,
        user_id.into_inner(),
        MediaKind::Image,
        Feature::Image,
        &payload.prompt,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/generate-video",
    tag = "generate",
    request_body = MediaRequest,
    responses(
        (status = 200, description = "Сгенерированное видео"),
        (status = 402, description = "Недостаточно монет")
    ),
    security(("bearer_auth" = []))
)]
#[post("/generate-video")]
pub async fn generate_video(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<MediaRequest>,
) -> impl Responder {
    generate_media(
        &state,
        user_id.into_inner(),
        MediaKind::Video,
        Feature::Video,
        &payload.prompt,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/create-character",
    tag = "generate",
    request_body = MediaRequest,
    responses(
        (status = 200, description = "Аватар нового персонажа"),
        (status = 402, description = "Недостаточно монет")
    ),
    security(("bearer_auth" = []))
)]
#[post("/create-character")]
pub async fn create_character(
    state: web::Data<AppState>,
    user_id: ReqData<i64>,
    payload: web::Json<MediaRequest>,
) -> impl Responder {
    generate_media(
        &state,
        user_id.into_inner(),
        MediaKind::Character,
        Feature::Character,
        &payload.prompt,
    )
    .await
}
