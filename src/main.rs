// src/main.rs
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::Client as S3Client;
use dotenvy::dotenv;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use companion_backend::billing::costs::CostCache;
use companion_backend::inference::InferenceClient;
use companion_backend::stripe_client::StripeClient;
use companion_backend::{api, docs, AppState};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Кеш стоимостей заполняется до первого запроса: пустая таблица — это
    // валидное состояние (дефолты), отсутствие загрузки — нет.
    let costs = Arc::new(CostCache::new());
    costs
        .load(&pool)
        .await
        .expect("Failed to load app config cache");

    let stripe_secret_key = env::var("STRIPE_SECRET_KEY").expect("STRIPE_SECRET_KEY required");
    let stripe_webhook_key = env::var("STRIPE_WEBHOOK_KEY").expect("STRIPE_WEBHOOK_KEY required");
    let inference_base_url =
        env::var("INFERENCE_BASE_URL").expect("INFERENCE_BASE_URL required");
    let inference_api_key = env::var("INFERENCE_API_KEY").expect("INFERENCE_API_KEY required");

    let s3_bucket = env::var("S3_BUCKET").expect("S3_BUCKET required");
    let s3_endpoint = env::var("S3_ENDPOINT").ok();
    let s3_public_base_url = env::var("S3_PUBLIC_BASE_URL")
        .unwrap_or_else(|_| format!("https://{}.s3.amazonaws.com", s3_bucket));

    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);

    // Кастомные S3-совместимые endpoint'ы (MinIO и пр.)
    if let Some(endpoint) = s3_endpoint {
        s3_config_builder = s3_config_builder
            .endpoint_url(endpoint)
            .force_path_style(true);
    }

    let s3_client = S3Client::from_conf(s3_config_builder.build());

    let state = web::Data::new(AppState {
        pool,
        costs,
        stripe: StripeClient::new(stripe_secret_key),
        inference: InferenceClient::new(inference_base_url, inference_api_key),
        s3_client,
        s3_bucket: s3_bucket.clone(),
        s3_public_base_url: s3_public_base_url.clone(),
        stripe_webhook_key,
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            // Защищённые роуты
            .service(
                web::scope("/api")
                    .wrap(api::auth::JwtMiddleware)
                    .service(api::wallet::get_user_coin)
                    .service(api::wallet::coin_cost)
                    .service(api::pricing::get_pricing)
                    .service(api::pricing::get_coin_pricing)
                    .service(api::pricing::get_promo)
                    .service(api::pricing::verify_promo)
                    .service(api::checkout::create_checkout_session)
                    .service(api::subscriptions::subscription_status)
                    .service(api::generate::generate_chat)
                    .service(api::generate::generate_image)
                    .service(api::generate::generate_video)
                    .service(api::generate::create_character)
                    .service(api::admin::set_app_config)
                    .service(api::admin::upsert_pricing),
            )
            // Вебхуки (публичные, своя подпись)
            .service(api::webhooks::stripe_webhook)
    })
    .bind(("0.0.0.0", 8065))?
    .run()
    .await
}
