// src/billing/store.rs
//
// Хранилище биллинга за трейтом: Postgres в проде, in-memory для тестов.
// Все мутации кошелька проходят здесь и только здесь, одной транзакцией
// с записью в леджер.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{PricingPlan, Subscription};

use super::error::BillingError;

/// Данные для создания/обновления подписки при checkout.session.completed.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub payment_customer_id: String,
    pub subscription_id: String,
    pub order_id: Option<String>,
    pub price_id: Option<String>,
    pub plan_name: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub coin_reward: i64,
}

/// Итог закрытия pending-заказа: нужен promo_id, чтобы один раз поднять счётчик.
#[derive(Debug, Clone)]
pub struct SettledOrder {
    pub id: i64,
    pub promo_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreditSpec<'a> {
    /// Может быть отрицательным (корректировка при даунгрейде).
    pub coins: i64,
    pub source_type: &'a str,
    pub order_ref: Option<&'a str>,
    pub subscription_ref: Option<&'a str>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub description: Option<&'a str>,
}

/// Поля подписки из subscription.updated/deleted.
#[derive(Debug, Clone)]
pub struct SubscriptionPatch<'a> {
    pub external_ref: &'a str,
    pub status: &'a str,
    pub price_ref: Option<&'a str>,
    pub plan_name: Option<&'a str>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub order_ref: Option<&'a str>,
}

/// Награда, применяемая вместе с патчем подписки.
#[derive(Debug, Clone)]
pub struct RewardSpec<'a> {
    /// Для продления: двигает last_rewarded_period_end только вперёд.
    /// Если период уже вознаграждён, награда не начисляется, но поля
    /// подписки всё равно обновляются.
    pub gate_period_end: Option<DateTime<Utc>>,
    pub credit: CreditSpec<'a>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Идемпотентность вебхуков: true — событие наше, обрабатываем;
    /// false — уже обработано кем-то раньше.
    async fn try_begin_event(&self, event_id: &str) -> Result<bool, BillingError>;

    /// Снимает маркер processed_events. Вызывается при временной ошибке
    /// обработки: без этого ретрай провайдера упрётся в AlreadyProcessed
    /// и событие будет потеряно.
    async fn release_event(&self, event_id: &str) -> Result<(), BillingError>;

    /// Пользователь по customer ref платёжного провайдера, с фолбэком на email.
    async fn find_user(
        &self,
        customer_ref: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<i64>, BillingError>;

    async fn attach_customer_ref(&self, user_id: i64, customer_ref: &str)
        -> Result<(), BillingError>;

    async fn pricing_by_price_ref(
        &self,
        price_ref: &str,
    ) -> Result<Option<PricingPlan>, BillingError>;

    /// None — у пользователя ещё нет кошелька.
    async fn wallet_balance(&self, user_id: i64) -> Result<Option<i64>, BillingError>;

    /// Атомарное списание: запись в леджер + условный декремент
    /// (`coin_balance >= coins`) одной транзакцией.
    /// Ok(false) — баланса не хватило на момент коммита, ничего не записано.
    async fn debit_coins(
        &self,
        user_id: i64,
        coins: i64,
        source_type: &str,
        subscription_ref: &str,
    ) -> Result<bool, BillingError>;

    /// Начисление (или знаковая корректировка): леджер + кошелёк одной
    /// транзакцией. Кошелёк создаётся при отсутствии, в том числе для
    /// отрицательной дельты. Нулевое начисление тоже оставляет строку в
    /// леджере — платёж с неизвестным тарифом виден в истории.
    async fn credit_coins(&self, user_id: i64, spec: CreditSpec<'_>) -> Result<(), BillingError>;

    /// Самая свежая подписка пользователя (по id).
    async fn latest_subscription(&self, user_id: i64)
        -> Result<Option<Subscription>, BillingError>;

    async fn subscription_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<Subscription>, BillingError>;

    /// Upsert по payment_customer_id: существующая строка обновляется на
    /// месте, иначе создаётся новая с last_rewarded_period_end =
    /// current_period_end и total_coins_rewarded = coin_reward.
    async fn upsert_subscription_from_checkout(
        &self,
        sub: &NewSubscription,
    ) -> Result<i64, BillingError>;

    /// Применяет subscription.updated/deleted одной транзакцией: патч полей,
    /// для продления — монотонный сдвиг last_rewarded_period_end, затем
    /// кошелёк, леджер и total_coins_rewarded. Ни частично применённого
    /// события, ни двойной награды при ретрае быть не может.
    /// Ok(true) — награда начислена.
    async fn apply_subscription_event(
        &self,
        sub_id: i64,
        user_id: i64,
        patch: SubscriptionPatch<'_>,
        reward: Option<RewardSpec<'_>>,
    ) -> Result<bool, BillingError>;

    /// Закрывает самый свежий pending-заказ пары (user, customer):
    /// status -> success, проставляет settlement ref. Переход случается
    /// не больше одного раза; None — подходящего заказа нет.
    async fn settle_pending_order(
        &self,
        user_id: i64,
        customer_ref: &str,
        order_ref: Option<&str>,
        subscription_ref: Option<&str>,
    ) -> Result<Option<SettledOrder>, BillingError>;

    async fn increment_promo_applied(&self, promo_id: i64) -> Result<(), BillingError>;
}

fn ledger_type_for(coins: i64) -> (&'static str, i64) {
    if coins < 0 {
        ("debit", -coins)
    } else {
        ("credit", coins)
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn try_begin_event(&self, event_id: &str) -> Result<bool, BillingError> {
        let res = sqlx::query(
            "INSERT INTO processed_events (event_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release_event(&self, event_id: &str) -> Result<(), BillingError> {
        sqlx::query("DELETE FROM processed_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_user(
        &self,
        customer_ref: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<i64>, BillingError> {
        if let Some(customer_ref) = customer_ref {
            let row = sqlx::query("SELECT id FROM users WHERE payment_customer_id = $1")
                .bind(customer_ref)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return Ok(Some(row.get("id")));
            }
        }
        if let Some(email) = email {
            let row = sqlx::query("SELECT id FROM users WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return Ok(Some(row.get("id")));
            }
        }
        Ok(None)
    }

    async fn attach_customer_ref(
        &self,
        user_id: i64,
        customer_ref: &str,
    ) -> Result<(), BillingError> {
        sqlx::query("UPDATE users SET payment_customer_id = $1 WHERE id = $2")
            .bind(customer_ref)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pricing_by_price_ref(
        &self,
        price_ref: &str,
    ) -> Result<Option<PricingPlan>, BillingError> {
        let row = sqlx::query(
            r#"SELECT id, plan_name, pricing_id, currency, price::text AS price,
                      coin_reward, billing_cycle, status
               FROM pricing_plan
               WHERE pricing_id = $1"#,
        )
        .bind(price_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(map_pricing_row))
    }

    async fn wallet_balance(&self, user_id: i64) -> Result<Option<i64>, BillingError> {
        let row = sqlx::query("SELECT coin_balance FROM user_wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("coin_balance")))
    }

    async fn debit_coins(
        &self,
        user_id: i64,
        coins: i64,
        source_type: &str,
        subscription_ref: &str,
    ) -> Result<bool, BillingError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO user_wallets (user_id, coin_balance) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"UPDATE user_wallets
               SET coin_balance = coin_balance - $1, updated_at = NOW()
               WHERE user_id = $2 AND coin_balance >= $1"#,
        )
        .bind(coins)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"INSERT INTO coin_transactions
                   (user_id, subscription_ref, transaction_type, coins, source_type, order_ref)
               VALUES ($1, $2, 'debit', $3, $4, 'default')"#,
        )
        .bind(user_id)
        .bind(subscription_ref)
        .bind(coins)
        .bind(source_type)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn credit_coins(&self, user_id: i64, spec: CreditSpec<'_>) -> Result<(), BillingError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO user_wallets (user_id, coin_balance) VALUES ($1, $2)
               ON CONFLICT (user_id) DO UPDATE
               SET coin_balance = user_wallets.coin_balance + EXCLUDED.coin_balance,
                   updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(spec.coins)
        .execute(&mut *tx)
        .await?;

        let (tx_type, abs_coins) = ledger_type_for(spec.coins);
        sqlx::query(
            r#"INSERT INTO coin_transactions
                   (user_id, subscription_ref, transaction_type, coins, source_type,
                    order_ref, description, period_start, period_end)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(user_id)
        .bind(spec.subscription_ref)
        .bind(tx_type)
        .bind(abs_coins)
        .bind(spec.source_type)
        .bind(spec.order_ref)
        .bind(spec.description)
        .bind(spec.period_start)
        .bind(spec.period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn latest_subscription(
        &self,
        user_id: i64,
    ) -> Result<Option<Subscription>, BillingError> {
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
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(map_subscription_row))
    }

    async fn subscription_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<Subscription>, BillingError> {
        let row = sqlx::query(
            r#"SELECT id, user_id, payment_customer_id, subscription_id, order_id, price_id,
                      plan_name, status, current_period_end, start_date,
                      last_rewarded_period_end, total_coins_rewarded
               FROM subscriptions
               WHERE payment_customer_id = $1
               ORDER BY id DESC
               LIMIT 1"#,
        )
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(map_subscription_row))
    }

    async fn upsert_subscription_from_checkout(
        &self,
        sub: &NewSubscription,
    ) -> Result<i64, BillingError> {
        let existing = sqlx::query(
            "SELECT id FROM subscriptions WHERE payment_customer_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(&sub.payment_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let id: i64 = row.get("id");
            sqlx::query(
                r#"UPDATE subscriptions
                   SET user_id = $1, subscription_id = $2, order_id = $3, price_id = $4,
                       plan_name = $5, status = 'active', current_period_end = $6,
                       last_rewarded_period_end = $6, updated_at = NOW()
                   WHERE id = $7"#,
            )
            .bind(sub.user_id)
            .bind(&sub.subscription_id)
            .bind(sub.order_id.as_deref())
            .bind(sub.price_id.as_deref())
            .bind(sub.plan_name.as_deref())
            .bind(sub.current_period_end)
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(id);
        }

        let row = sqlx::query(
            r#"INSERT INTO subscriptions
                   (user_id, payment_customer_id, subscription_id, order_id, price_id,
                    plan_name, status, current_period_end, last_rewarded_period_end,
                    total_coins_rewarded)
               VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $7, $8)
               RETURNING id"#,
        )
        .bind(sub.user_id)
        .bind(&sub.payment_customer_id)
        .bind(&sub.subscription_id)
        .bind(sub.order_id.as_deref())
        .bind(sub.price_id.as_deref())
        .bind(sub.plan_name.as_deref())
        .bind(sub.current_period_end)
        .bind(sub.coin_reward)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn apply_subscription_event(
        &self,
        sub_id: i64,
        user_id: i64,
        patch: SubscriptionPatch<'_>,
        reward: Option<RewardSpec<'_>>,
    ) -> Result<bool, BillingError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"UPDATE subscriptions
               SET subscription_id = $1, status = $2, price_id = $3, plan_name = $4,
                   current_period_end = $5, order_id = COALESCE($6, order_id),
                   updated_at = NOW()
               WHERE id = $7"#,
        )
        .bind(patch.external_ref)
        .bind(patch.status)
        .bind(patch.price_ref)
        .bind(patch.plan_name)
        .bind(patch.current_period_end)
        .bind(patch.order_ref)
        .bind(sub_id)
        .execute(&mut *tx)
        .await?;

        let Some(reward) = reward else {
            tx.commit().await?;
            return Ok(false);
        };

        if let Some(gate) = reward.gate_period_end {
            let res = sqlx::query(
                r#"UPDATE subscriptions
                   SET last_rewarded_period_end = $1
                   WHERE id = $2
                     AND (last_rewarded_period_end IS NULL OR last_rewarded_period_end < $1)"#,
            )
            .bind(gate)
            .bind(sub_id)
            .execute(&mut *tx)
            .await?;
            // Период уже вознаграждён: патч коммитим, награду нет.
            if res.rows_affected() == 0 {
                tx.commit().await?;
                return Ok(false);
            }
        }

        let spec = &reward.credit;
        sqlx::query(
            r#"INSERT INTO user_wallets (user_id, coin_balance) VALUES ($1, $2)
               ON CONFLICT (user_id) DO UPDATE
               SET coin_balance = user_wallets.coin_balance + EXCLUDED.coin_balance,
                   updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(spec.coins)
        .execute(&mut *tx)
        .await?;

        let (tx_type, abs_coins) = ledger_type_for(spec.coins);
        sqlx::query(
            r#"INSERT INTO coin_transactions
                   (user_id, subscription_ref, transaction_type, coins, source_type,
                    order_ref, description, period_start, period_end)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(user_id)
        .bind(spec.subscription_ref)
        .bind(tx_type)
        .bind(abs_coins)
        .bind(spec.source_type)
        .bind(spec.order_ref)
        .bind(spec.description)
        .bind(spec.period_start)
        .bind(spec.period_end)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"UPDATE subscriptions
               SET total_coins_rewarded = total_coins_rewarded + $1, updated_at = NOW()
               WHERE id = $2"#,
        )
        .bind(spec.coins)
        .bind(sub_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn settle_pending_order(
        &self,
        user_id: i64,
        customer_ref: &str,
        order_ref: Option<&str>,
        subscription_ref: Option<&str>,
    ) -> Result<Option<SettledOrder>, BillingError> {
        let row = sqlx::query(
            r#"UPDATE orders
               SET status = 'success', order_id = $3, subscription_id = $4
               WHERE id = (SELECT id FROM orders
                           WHERE user_id = $1 AND stripe_customer_id = $2 AND status = 'pending'
                           ORDER BY id DESC
                           LIMIT 1)
               RETURNING id, promo_id"#,
        )
        .bind(user_id)
        .bind(customer_ref)
        .bind(order_ref)
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SettledOrder {
            id: r.get("id"),
            promo_id: r.get("promo_id"),
        }))
    }

    async fn increment_promo_applied(&self, promo_id: i64) -> Result<(), BillingError> {
        sqlx::query(
            "UPDATE promo_management SET applied_count = applied_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(promo_id)
        .execute(&self.pool)
        .await?;
        Ok(())
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

fn map_subscription_row(r: sqlx::postgres::PgRow) -> Subscription {
    Subscription {
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
    }
}

/// In-memory реализация для тестов (без Postgres).
pub mod test {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::models::CoinTransaction;

    #[derive(Debug, Clone)]
    pub struct TestUser {
        pub id: i64,
        pub email: Option<String>,
        pub customer_ref: Option<String>,
        pub role: String,
    }

    #[derive(Debug, Clone)]
    pub struct TestOrder {
        pub id: i64,
        pub user_id: i64,
        pub customer_ref: String,
        pub promo_id: Option<i64>,
        pub order_ref: Option<String>,
        pub subscription_ref: Option<String>,
        pub status: String,
    }

    #[derive(Default)]
    struct Inner {
        users: Vec<TestUser>,
        wallets: HashMap<i64, i64>,
        ledger: Vec<CoinTransaction>,
        pricing: HashMap<String, PricingPlan>,
        subscriptions: Vec<Subscription>,
        orders: Vec<TestOrder>,
        promo_applied: HashMap<i64, i64>,
        processed: HashSet<String>,
        next_id: i64,
    }

    #[derive(Clone, Default)]
    pub struct InMemoryStore {
        inner: Arc<Mutex<Inner>>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn next_id(inner: &mut Inner) -> i64 {
            inner.next_id += 1;
            inner.next_id
        }

        pub fn seed_user(&self, id: i64, email: Option<&str>, customer_ref: Option<&str>) {
            self.lock().users.push(TestUser {
                id,
                email: email.map(str::to_string),
                customer_ref: customer_ref.map(str::to_string),
                role: "user".to_string(),
            });
        }

        pub fn seed_wallet(&self, user_id: i64, balance: i64) {
            self.lock().wallets.insert(user_id, balance);
        }

        pub fn seed_pricing(&self, pricing_id: &str, plan_name: &str, coin_reward: i64, cycle: &str) {
            let mut inner = self.lock();
            let id = Self::next_id(&mut inner);
            inner.pricing.insert(
                pricing_id.to_string(),
                PricingPlan {
                    id,
                    plan_name: plan_name.to_string(),
                    pricing_id: pricing_id.to_string(),
                    currency: "USD".to_string(),
                    price: "9.99".to_string(),
                    coin_reward,
                    billing_cycle: cycle.to_string(),
                    status: "Active".to_string(),
                },
            );
        }

        pub fn seed_subscription(&self, sub: Subscription) {
            self.lock().subscriptions.push(sub);
        }

        pub fn seed_pending_order(&self, user_id: i64, customer_ref: &str, promo_id: Option<i64>) -> i64 {
            let mut inner = self.lock();
            let id = Self::next_id(&mut inner);
            inner.orders.push(TestOrder {
                id,
                user_id,
                customer_ref: customer_ref.to_string(),
                promo_id,
                order_ref: None,
                subscription_ref: None,
                status: "pending".to_string(),
            });
            id
        }

        pub fn seed_promo(&self, promo_id: i64) {
            self.lock().promo_applied.insert(promo_id, 0);
        }

        // Инспекция состояния из тестов.

        pub fn balance(&self, user_id: i64) -> Option<i64> {
            self.lock().wallets.get(&user_id).copied()
        }

        pub fn ledger(&self) -> Vec<CoinTransaction> {
            self.lock().ledger.clone()
        }

        pub fn orders(&self) -> Vec<TestOrder> {
            self.lock().orders.clone()
        }

        pub fn promo_applied(&self, promo_id: i64) -> i64 {
            self.lock().promo_applied.get(&promo_id).copied().unwrap_or(0)
        }

        pub fn subscription(&self, sub_id: i64) -> Option<Subscription> {
            self.lock()
                .subscriptions
                .iter()
                .find(|s| s.id == sub_id)
                .cloned()
        }

        /// Баланс, пересчитанный из леджера независимо от кошелька.
        pub fn ledger_balance(&self, user_id: i64) -> i64 {
            self.lock()
                .ledger
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| if t.transaction_type == "credit" { t.coins } else { -t.coins })
                .sum()
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryStore {
        async fn try_begin_event(&self, event_id: &str) -> Result<bool, BillingError> {
            Ok(self.lock().processed.insert(event_id.to_string()))
        }

        async fn release_event(&self, event_id: &str) -> Result<(), BillingError> {
            self.lock().processed.remove(event_id);
            Ok(())
        }

        async fn find_user(
            &self,
            customer_ref: Option<&str>,
            email: Option<&str>,
        ) -> Result<Option<i64>, BillingError> {
            let inner = self.lock();
            if let Some(customer_ref) = customer_ref {
                if let Some(u) = inner
                    .users
                    .iter()
                    .find(|u| u.customer_ref.as_deref() == Some(customer_ref))
                {
                    return Ok(Some(u.id));
                }
            }
            if let Some(email) = email {
                if let Some(u) = inner.users.iter().find(|u| u.email.as_deref() == Some(email)) {
                    return Ok(Some(u.id));
                }
            }
            Ok(None)
        }

        async fn attach_customer_ref(
            &self,
            user_id: i64,
            customer_ref: &str,
        ) -> Result<(), BillingError> {
            let mut inner = self.lock();
            if let Some(u) = inner.users.iter_mut().find(|u| u.id == user_id) {
                u.customer_ref = Some(customer_ref.to_string());
            }
            Ok(())
        }

        async fn pricing_by_price_ref(
            &self,
            price_ref: &str,
        ) -> Result<Option<PricingPlan>, BillingError> {
            Ok(self.lock().pricing.get(price_ref).cloned())
        }

        async fn wallet_balance(&self, user_id: i64) -> Result<Option<i64>, BillingError> {
            Ok(self.lock().wallets.get(&user_id).copied())
        }

        async fn debit_coins(
            &self,
            user_id: i64,
            coins: i64,
            source_type: &str,
            subscription_ref: &str,
        ) -> Result<bool, BillingError> {
            let mut inner = self.lock();
            let balance = inner.wallets.entry(user_id).or_insert(0);
            if *balance < coins {
                return Ok(false);
            }
            *balance -= coins;
            let id = Self::next_id(&mut inner);
            inner.ledger.push(CoinTransaction {
                id,
                user_id,
                subscription_ref: Some(subscription_ref.to_string()),
                transaction_type: "debit".to_string(),
                coins,
                source_type: source_type.to_string(),
                order_ref: Some("default".to_string()),
                description: None,
                period_start: None,
                period_end: None,
                created_at: Some(Utc::now()),
            });
            Ok(true)
        }

        async fn credit_coins(
            &self,
            user_id: i64,
            spec: CreditSpec<'_>,
        ) -> Result<(), BillingError> {
            let mut inner = self.lock();
            *inner.wallets.entry(user_id).or_insert(0) += spec.coins;
            let (tx_type, abs_coins) = ledger_type_for(spec.coins);
            let id = Self::next_id(&mut inner);
            inner.ledger.push(CoinTransaction {
                id,
                user_id,
                subscription_ref: spec.subscription_ref.map(str::to_string),
                transaction_type: tx_type.to_string(),
                coins: abs_coins,
                source_type: spec.source_type.to_string(),
                order_ref: spec.order_ref.map(str::to_string),
                description: spec.description.map(str::to_string),
                period_start: spec.period_start,
                period_end: spec.period_end,
                created_at: Some(Utc::now()),
            });
            Ok(())
        }

        async fn latest_subscription(
            &self,
            user_id: i64,
        ) -> Result<Option<Subscription>, BillingError> {
            Ok(self
                .lock()
                .subscriptions
                .iter()
                .filter(|s| s.user_id == user_id)
                .max_by_key(|s| s.id)
                .cloned())
        }

        async fn subscription_by_customer_ref(
            &self,
            customer_ref: &str,
        ) -> Result<Option<Subscription>, BillingError> {
            Ok(self
                .lock()
                .subscriptions
                .iter()
                .filter(|s| s.payment_customer_id == customer_ref)
                .max_by_key(|s| s.id)
                .cloned())
        }

        async fn upsert_subscription_from_checkout(
            &self,
            sub: &NewSubscription,
        ) -> Result<i64, BillingError> {
            let mut inner = self.lock();
            if let Some(existing) = inner
                .subscriptions
                .iter_mut()
                .filter(|s| s.payment_customer_id == sub.payment_customer_id)
                .max_by_key(|s| s.id)
            {
                existing.user_id = sub.user_id;
                existing.subscription_id = sub.subscription_id.clone();
                existing.order_id = sub.order_id.clone();
                existing.price_id = sub.price_id.clone();
                existing.plan_name = sub.plan_name.clone();
                existing.status = "active".to_string();
                existing.current_period_end = sub.current_period_end;
                existing.last_rewarded_period_end = sub.current_period_end;
                return Ok(existing.id);
            }
            let id = Self::next_id(&mut inner);
            inner.subscriptions.push(Subscription {
                id,
                user_id: sub.user_id,
                payment_customer_id: sub.payment_customer_id.clone(),
                subscription_id: sub.subscription_id.clone(),
                order_id: sub.order_id.clone(),
                price_id: sub.price_id.clone(),
                plan_name: sub.plan_name.clone(),
                status: "active".to_string(),
                current_period_end: sub.current_period_end,
                start_date: Some(Utc::now()),
                last_rewarded_period_end: sub.current_period_end,
                total_coins_rewarded: sub.coin_reward,
            });
            Ok(id)
        }

        async fn apply_subscription_event(
            &self,
            sub_id: i64,
            user_id: i64,
            patch: SubscriptionPatch<'_>,
            reward: Option<RewardSpec<'_>>,
        ) -> Result<bool, BillingError> {
            let mut inner = self.lock();

            let Some(idx) = inner.subscriptions.iter().position(|s| s.id == sub_id) else {
                return Ok(false);
            };
            {
                let sub = &mut inner.subscriptions[idx];
                sub.subscription_id = patch.external_ref.to_string();
                sub.status = patch.status.to_string();
                sub.price_id = patch.price_ref.map(str::to_string);
                sub.plan_name = patch.plan_name.map(str::to_string);
                sub.current_period_end = patch.current_period_end;
                if let Some(order_ref) = patch.order_ref {
                    sub.order_id = Some(order_ref.to_string());
                }
            }

            let Some(reward) = reward else {
                return Ok(false);
            };

            if let Some(gate) = reward.gate_period_end {
                let sub = &mut inner.subscriptions[idx];
                let advance = match sub.last_rewarded_period_end {
                    None => true,
                    Some(prev) => prev < gate,
                };
                if !advance {
                    return Ok(false);
                }
                sub.last_rewarded_period_end = Some(gate);
            }

            let spec = &reward.credit;
            *inner.wallets.entry(user_id).or_insert(0) += spec.coins;
            let (tx_type, abs_coins) = ledger_type_for(spec.coins);
            let id = Self::next_id(&mut inner);
            inner.ledger.push(CoinTransaction {
                id,
                user_id,
                subscription_ref: spec.subscription_ref.map(str::to_string),
                transaction_type: tx_type.to_string(),
                coins: abs_coins,
                source_type: spec.source_type.to_string(),
                order_ref: spec.order_ref.map(str::to_string),
                description: spec.description.map(str::to_string),
                period_start: spec.period_start,
                period_end: spec.period_end,
                created_at: Some(Utc::now()),
            });
            inner.subscriptions[idx].total_coins_rewarded += spec.coins;

            Ok(true)
        }

        async fn settle_pending_order(
            &self,
            user_id: i64,
            customer_ref: &str,
            order_ref: Option<&str>,
            subscription_ref: Option<&str>,
        ) -> Result<Option<SettledOrder>, BillingError> {
            let mut inner = self.lock();
            if let Some(order) = inner
                .orders
                .iter_mut()
                .filter(|o| {
                    o.user_id == user_id && o.customer_ref == customer_ref && o.status == "pending"
                })
                .max_by_key(|o| o.id)
            {
                order.status = "success".to_string();
                order.order_ref = order_ref.map(str::to_string);
                order.subscription_ref = subscription_ref.map(str::to_string);
                return Ok(Some(SettledOrder {
                    id: order.id,
                    promo_id: order.promo_id,
                }));
            }
            Ok(None)
        }

        async fn increment_promo_applied(&self, promo_id: i64) -> Result<(), BillingError> {
            *self.lock().promo_applied.entry(promo_id).or_insert(0) += 1;
            Ok(())
        }
    }
}
