// src/db.rs

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{PricingPlan, PromoManagement, Subscription, User, UserWallet};

pub async fn get_user(pool: &PgPool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, username, email, role, payment_customer_id FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(map_user_row))
}

pub async fn get_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, username, email, role, payment_customer_id FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(map_user_row))
}

pub async fn get_wallet(pool: &PgPool, user_id: i64) -> Result<Option<UserWallet>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT user_id, coin_balance, updated_at FROM user_wallets WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| UserWallet {
        user_id: r.get("user_id"),
        coin_balance: r.get("coin_balance"),
        updated_at: r.get("updated_at"),
    }))
}

/// Активные подписочные тарифы (Monthly/Yearly), опционально один цикл.
pub async fn list_subscription_pricing(
    pool: &PgPool,
    billing_cycle: Option<&str>,
) -> Result<Vec<PricingPlan>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT id, plan_name, pricing_id, currency, price::text AS price,
                  coin_reward, billing_cycle, status
           FROM pricing_plan
           WHERE status = 'Active'
             AND billing_cycle IN ('Monthly', 'Yearly')
             AND ($1::text IS NULL OR billing_cycle = $1)
           ORDER BY price ASC"#,
    )
    .bind(billing_cycle)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(map_pricing_row).collect())
}

/// Разовые паки монет.
pub async fn list_coin_pricing(pool: &PgPool) -> Result<Vec<PricingPlan>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT id, plan_name, pricing_id, currency, price::text AS price,
                  coin_reward, billing_cycle, status
           FROM pricing_plan
           WHERE status = 'Active' AND billing_cycle = 'One Time'
           ORDER BY price ASC"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(map_pricing_row).collect())
}

pub async fn get_pricing_by_ref(
    pool: &PgPool,
    pricing_id: &str,
) -> Result<Option<PricingPlan>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT id, plan_name, pricing_id, currency, price::text AS price,
                  coin_reward, billing_cycle, status
           FROM pricing_plan
           WHERE pricing_id = $1"#,
    )
    .bind(pricing_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(map_pricing_row))
}

pub async fn upsert_pricing(
    pool: &PgPool,
    plan_name: &str,
    pricing_id: &str,
    currency: &str,
    price: &str,
    coin_reward: i64,
    billing_cycle: &str,
    status: &str,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"INSERT INTO pricing_plan
               (plan_name, pricing_id, currency, price, coin_reward, billing_cycle, status)
           VALUES ($1, $2, $3, $4::numeric, $5, $6, $7)
           ON CONFLICT (pricing_id)
           DO UPDATE SET
               plan_name = EXCLUDED.plan_name,
               currency = EXCLUDED.currency,
               price = EXCLUDED.price,
               coin_reward = EXCLUDED.coin_reward,
               billing_cycle = EXCLUDED.billing_cycle,
               status = EXCLUDED.status,
               updated_at = NOW()
           RETURNING id"#,
    )
    .bind(plan_name)
    .bind(pricing_id)
    .bind(currency)
    .bind(price)
    .bind(coin_reward)
    .bind(billing_cycle)
    .bind(status)
    .fetch_one(pool)
    .await?;

    Ok(row.get("id"))
}

pub async fn list_promos(pool: &PgPool) -> Result<Vec<PromoManagement>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT id, promo_name, discount_type, coupon, percent_off::text AS percent_off,
                  stripe_promotion_id, stripe_coupon_id, start_date, expiry_date,
                  status, applied_count
           FROM promo_management
           ORDER BY id DESC"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(map_promo_row).collect())
}

/// Купоны хранятся в верхнем регистре, поиск регистронезависимый.
pub async fn get_promo_by_coupon(
    pool: &PgPool,
    coupon: &str,
) -> Result<Option<PromoManagement>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT id, promo_name, discount_type, coupon, percent_off::text AS percent_off,
                  stripe_promotion_id, stripe_coupon_id, start_date, expiry_date,
                  status, applied_count
           FROM promo_management
           WHERE coupon = UPPER($1)"#,
    )
    .bind(coupon)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(map_promo_row))
}

/// Заказ фиксируется в pending до ухода на оплату; закрывает его вебхук.
#[allow(clippy::too_many_arguments)]
pub async fn insert_pending_order(
    pool: &PgPool,
    user_id: i64,
    customer_ref: &str,
    promo_id: Option<i64>,
    promo_code: Option<&str>,
    discount_type: Option<&str>,
    discount_applied: &str,
    subtotal_at_apply: &str,
    currency: &str,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"INSERT INTO orders
               (user_id, stripe_customer_id, promo_id, promo_code, discount_type,
                discount_applied, subtotal_at_apply, currency, status)
           VALUES ($1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8, 'pending')
           RETURNING id"#,
    )
    .bind(user_id)
    .bind(customer_ref)
    .bind(promo_id)
    .bind(promo_code)
    .bind(discount_type)
    .bind(discount_applied)
    .bind(subtotal_at_apply)
    .bind(currency)
    .fetch_one(pool)
    .await?;

    Ok(row.get("id"))
}

pub async fn get_latest_subscription(
    pool: &PgPool,
    user_id: i64,
) -> Result<Option<Subscription>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT id, user_id, payment_customer_id, subscription_id, order_id, price_id,
                  plan_name, status, current_period_end, start_date,
                  last_rewarded_period_end, total_coins_rewarded
           FROM subscriptions
           WHERE user_id = $1
           ORDER BY id DESC
           LIMIT 1"#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Subscription {
        id: r.get("id"),
        user_id: r.get("user_id"),
        payment_customer_id: r.get("payment_customer_id"),
        subscription_id: r.get("subscription_id"),
        order_id: r.get("order_id"),
        price_id: r.get("price_id"),
        plan_name: r.get("plan_name"),
        status: r.get("status"),
        current_period_end: r.get("current_period_end"),
        start_date: r.get("start_date"),
        last_rewarded_period_end: r.get("last_rewarded_period_end"),
        total_coins_rewarded: r.get("total_coins_rewarded"),
    }))
}

pub async fn upsert_app_config(
    pool: &PgPool,
    parameter_name: &str,
    parameter_value: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO app_config (parameter_name, parameter_value)
           VALUES ($1, $2)
           ON CONFLICT (parameter_name)
           DO UPDATE SET parameter_value = EXCLUDED.parameter_value, updated_at = NOW()"#,
    )
    .bind(parameter_name)
    .bind(parameter_value)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_media(
    pool: &PgPool,
    user_id: i64,
    media_type: &str,
    s3_url: Option<&str>,
    coins_consumed: i64,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"INSERT INTO media (user_id, media_type, s3_url, coins_consumed)
           VALUES ($1, $2, $3, $4)
           RETURNING id"#,
    )
    .bind(user_id)
    .bind(media_type)
    .bind(s3_url)
    .bind(coins_consumed)
    .fetch_one(pool)
    .await?;

    Ok(row.get("id"))
}

fn map_user_row(r: sqlx::postgres::PgRow) -> User {
    User {
        id: r.get("id"),
        username: r.get("username"),
        email: r.get("email"),
        role: r.get("role"),
        payment_customer_id: r.get("payment_customer_id"),
    }
}

fn map_pricing_row(r: sqlx::postgres::PgRow) -> PricingPlan {
    PricingPlan {
        id: r.get("id"),
        plan_name: r.get("plan_name"),
        pricing_id: r.get("pricing_id"),
        currency: r.get("currency"),
        price: r.get("price"),
        coin_reward: r.get("coin_reward"),
        billing_cycle: r.get("billing_cycle"),
        status: r.get("status"),
    }
}

fn map_promo_row(r: sqlx::postgres::PgRow) -> PromoManagement {
    PromoManagement {
        id: r.get("id"),
        promo_name: r.get("promo_name"),
        discount_type: r.get("discount_type"),
        coupon: r.get("coupon"),
        percent_off: r.get("percent_off"),
        stripe_promotion_id: r.get("stripe_promotion_id"),
        stripe_coupon_id: r.get("stripe_coupon_id"),
        start_date: r.get("start_date"),
        expiry_date: r.get("expiry_date"),
        status: r.get("status"),
        applied_count: r.get("applied_count"),
    }
}

/// Промо действует: статус active и сегодня внутри окна действия.
pub fn promo_is_active(promo: &PromoManagement, now: DateTime<Utc>) -> bool {
    if !promo.status.eq_ignore_ascii_case("active") {
        return false;
    }
    if let Some(start) = promo.start_date {
        if now < start {
            return false;
        }
    }
    if let Some(expiry) = promo.expiry_date {
        if now > expiry {
            return false;
        }
    }
    true
}
