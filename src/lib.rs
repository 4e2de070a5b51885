pub mod api;
pub mod billing;
pub mod db;
pub mod docs;
pub mod inference;
pub mod models;
pub mod s3_utils;
pub mod stripe_client;

use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use sqlx::PgPool;

use crate::billing::costs::CostCache;
use crate::inference::InferenceClient;
use crate::stripe_client::StripeClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub costs: Arc<CostCache>,
    pub stripe: StripeClient,
    pub inference: InferenceClient,
    pub s3_client: S3Client,
    pub s3_bucket: String,
    pub s3_public_base_url: String,
    pub stripe_webhook_key: String,
}
