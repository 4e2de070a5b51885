// src/models.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub email: String,
    pub role: String, // user | admin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserWallet {
    pub user_id: i64,
    pub coin_balance: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Запись леджера. Append-only: знак суммы несёт transaction_type,
/// `coins` всегда >= 0.
#[derive(Debug, Clone, Serialize)]
pub struct CoinTransaction {
    pub id: i64,
    pub user_id: i64,
    pub subscription_ref: Option<String>,
    pub transaction_type: String, // credit | debit
    pub coins: i64,
    pub source_type: String, // chat | image | video | character | subscription | coin_purchase
    pub order_ref: Option<String>,
    pub description: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PricingPlan {
    pub id: i64,
    pub plan_name: String,
    pub pricing_id: String,
    pub currency: String,
    pub price: String,
    pub coin_reward: i64,
    pub billing_cycle: String, // Monthly | Yearly | One Time
    pub status: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub payment_customer_id: String,
    pub subscription_id: String,
    pub order_id: Option<String>,
    pub price_id: Option<String>,
    pub plan_name: Option<String>,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub last_rewarded_period_end: Option<DateTime<Utc>>,
    pub total_coins_rewarded: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PromoManagement {
    pub id: i64,
    pub promo_name: String,
    pub discount_type: String,
    pub coupon: String, // хранится в UPPER
    pub percent_off: String,
    pub stripe_promotion_id: Option<String>,
    pub stripe_coupon_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub status: String,
    pub applied_count: i64,
}
