// src/billing/reconcile.rs
//
// Сверка событий платёжного провайдера с локальным состоянием:
// заказы, подписки, леджер, кошелёк. Событие может прийти дважды и в любом
// порядке, поэтому каждая обработка начинается с маркера в processed_events,
// а награда за период гейтится монотонным last_rewarded_period_end.
// При временной ошибке маркер снимается — ретрай провайдера проходит заново,
// порядок шагов внутри обработки подобран так, чтобы повтор не задваивал
// деньги.

use chrono::{DateTime, Utc};

use super::error::BillingError;
use super::store::{BillingStore, CreditSpec, NewSubscription, RewardSpec, SubscriptionPatch};

pub const RENEWAL_REWARD_DESC: &str = "Subscription Renewal Reward";
pub const PLAN_CHANGE_DESC: &str = "Subscription Plan Change Adjustment";

/// checkout.session.completed, mode=payment (разовая покупка монет).
#[derive(Debug, Clone)]
pub struct OneTimeCheckout {
    pub event_id: String,
    pub customer_ref: Option<String>,
    pub email: Option<String>,
    pub price_ref: Option<String>,
    /// payment_intent — играет роль order ref при разовой покупке.
    pub settlement_ref: Option<String>,
}

/// checkout.session.completed, mode=subscription (после дозапроса
/// живого объекта подписки у провайдера).
#[derive(Debug, Clone)]
pub struct SubscriptionCheckout {
    pub event_id: String,
    pub customer_ref: Option<String>,
    pub email: Option<String>,
    pub subscription_ref: String,
    pub price_ref: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub latest_invoice: Option<String>,
}

/// customer.subscription.updated / deleted: продление, смена плана, отмена.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub event_id: String,
    pub customer_ref: Option<String>,
    pub subscription_ref: String,
    pub status: Option<String>,
    pub price_ref: Option<String>,
    pub price_nickname: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub latest_invoice: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Повторная доставка, всё уже применено.
    AlreadyProcessed,
    /// Событие подтверждаем провайдеру, но локально применить нечего.
    Skipped(&'static str),
}

/// Доля оставшегося оплаченного периода, [0; ...). Не клампится сверху:
/// события из будущего периода дают ratio > 1, как в проде.
pub fn remaining_ratio(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let total_days = (end - start).num_days().max(1);
    let elapsed_days = (now - start).num_days();
    (((total_days - elapsed_days) as f64) / total_days as f64).max(0.0)
}

/// Дельта при смене плана: округление на каждое слагаемое, не на итог.
/// Может отличаться на +-1 монету от округления итога — поведение сохранено
/// сознательно, чтобы не менять начисления задним числом.
pub fn plan_change_delta(old_coins: i64, new_coins: i64, ratio: f64) -> i64 {
    let remaining_new = (new_coins as f64 * ratio).round() as i64;
    let remaining_old = (old_coins as f64 * ratio).round() as i64;
    remaining_new - remaining_old
}

/// Снимает маркер события после неудавшейся обработки. Ошибку самого
/// снятия глотаем с логом: исходная ошибка важнее, а застрявший маркер
/// виден в processed_events.
async fn release_marker(store: &impl BillingStore, event_id: &str) {
    if let Err(e) = store.release_event(event_id).await {
        log::error!("failed to release event marker, event_id={event_id}: {e}");
    }
}

pub async fn reconcile_one_time_checkout(
    store: &impl BillingStore,
    ev: OneTimeCheckout,
) -> Result<Outcome, BillingError> {
    if !store.try_begin_event(&ev.event_id).await? {
        return Ok(Outcome::AlreadyProcessed);
    }
    let event_id = ev.event_id.clone();
    match apply_one_time_checkout(store, ev).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            release_marker(store, &event_id).await;
            Err(e)
        }
    }
}

async fn apply_one_time_checkout(
    store: &impl BillingStore,
    ev: OneTimeCheckout,
) -> Result<Outcome, BillingError> {
    // Неизвестный price — валидный случай (legacy-тариф), награда 0.
    let coins = match ev.price_ref.as_deref() {
        Some(price_ref) => store
            .pricing_by_price_ref(price_ref)
            .await?
            .map(|p| p.coin_reward)
            .unwrap_or(0),
        None => 0,
    };

    let Some(user_id) = store
        .find_user(ev.customer_ref.as_deref(), ev.email.as_deref())
        .await?
    else {
        log::warn!(
            "one-time checkout for unknown user, event_id={} customer={:?}",
            ev.event_id,
            ev.customer_ref
        );
        return Ok(Outcome::Skipped("unknown user"));
    };

    let subscription_ref = match ev.customer_ref.as_deref() {
        Some(customer_ref) => {
            store.attach_customer_ref(user_id, customer_ref).await?;
            store
                .subscription_by_customer_ref(customer_ref)
                .await?
                .map(|s| s.subscription_id)
        }
        None => None,
    };

    // Заказ закрывается до начисления: если начисление упадёт и событие
    // придёт повторно, settle вернёт None и монеты не задвоятся.
    if let Some(customer_ref) = ev.customer_ref.as_deref() {
        store
            .settle_pending_order(
                user_id,
                customer_ref,
                ev.settlement_ref.as_deref(),
                subscription_ref.as_deref(),
            )
            .await?;
    }

    store
        .credit_coins(
            user_id,
            CreditSpec {
                coins,
                source_type: "coin_purchase",
                order_ref: ev.settlement_ref.as_deref(),
                subscription_ref: subscription_ref.as_deref(),
                period_start: None,
                period_end: None,
                description: None,
            },
        )
        .await?;

    log::info!(
        "one-time checkout settled, event_id={} user_id={} coins={}",
        ev.event_id,
        user_id,
        coins
    );
    Ok(Outcome::Processed)
}

pub async fn reconcile_subscription_checkout(
    store: &impl BillingStore,
    ev: SubscriptionCheckout,
) -> Result<Outcome, BillingError> {
    if !store.try_begin_event(&ev.event_id).await? {
        return Ok(Outcome::AlreadyProcessed);
    }
    let event_id = ev.event_id.clone();
    match apply_subscription_checkout(store, ev).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            release_marker(store, &event_id).await;
            Err(e)
        }
    }
}

async fn apply_subscription_checkout(
    store: &impl BillingStore,
    ev: SubscriptionCheckout,
) -> Result<Outcome, BillingError> {
    let pricing = match ev.price_ref.as_deref() {
        Some(price_ref) => store.pricing_by_price_ref(price_ref).await?,
        None => None,
    };
    let coins = pricing.as_ref().map(|p| p.coin_reward).unwrap_or(0);
    let plan_name = pricing.as_ref().map(|p| p.plan_name.clone());

    let Some(user_id) = store
        .find_user(ev.customer_ref.as_deref(), ev.email.as_deref())
        .await?
    else {
        log::warn!(
            "subscription checkout for unknown user, event_id={} customer={:?}",
            ev.event_id,
            ev.customer_ref
        );
        return Ok(Outcome::Skipped("unknown user"));
    };

    let Some(customer_ref) = ev.customer_ref.clone() else {
        return Ok(Outcome::Skipped("missing customer ref"));
    };
    store.attach_customer_ref(user_id, &customer_ref).await?;

    store
        .upsert_subscription_from_checkout(&NewSubscription {
            user_id,
            payment_customer_id: customer_ref.clone(),
            subscription_id: ev.subscription_ref.clone(),
            order_id: ev.latest_invoice.clone(),
            price_id: ev.price_ref.clone(),
            plan_name,
            current_period_end: ev.current_period_end,
            coin_reward: coins,
        })
        .await?;

    let settled = store
        .settle_pending_order(
            user_id,
            &customer_ref,
            ev.latest_invoice.as_deref(),
            Some(&ev.subscription_ref),
        )
        .await?;

    // Счётчик применений промо растёт один раз на закрытый заказ:
    // сам переход pending -> success случается не больше одного раза.
    if let Some(promo_id) = settled.and_then(|o| o.promo_id) {
        store.increment_promo_applied(promo_id).await?;
    }

    // Начисление идёт последним: при ретрае после сбоя идемпотентные шаги
    // выше прокручиваются вхолостую, а монеты выдаются ровно один раз.
    store
        .credit_coins(
            user_id,
            CreditSpec {
                coins,
                source_type: "subscription",
                order_ref: ev.latest_invoice.as_deref(),
                subscription_ref: Some(&ev.subscription_ref),
                period_start: ev.current_period_start,
                period_end: ev.current_period_end,
                description: None,
            },
        )
        .await?;

    log::info!(
        "subscription checkout settled, event_id={} user_id={} sub={} coins={}",
        ev.event_id,
        user_id,
        ev.subscription_ref,
        coins
    );
    Ok(Outcome::Processed)
}

pub async fn reconcile_subscription_change(
    store: &impl BillingStore,
    ev: SubscriptionChange,
    now: DateTime<Utc>,
) -> Result<Outcome, BillingError> {
    if !store.try_begin_event(&ev.event_id).await? {
        return Ok(Outcome::AlreadyProcessed);
    }
    let event_id = ev.event_id.clone();
    match apply_subscription_change(store, ev, now).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            release_marker(store, &event_id).await;
            Err(e)
        }
    }
}

async fn apply_subscription_change(
    store: &impl BillingStore,
    ev: SubscriptionChange,
    now: DateTime<Utc>,
) -> Result<Outcome, BillingError> {
    let Some(user_id) = store.find_user(ev.customer_ref.as_deref(), None).await? else {
        log::warn!(
            "subscription change for unknown customer, event_id={} customer={:?}",
            ev.event_id,
            ev.customer_ref
        );
        return Ok(Outcome::Skipped("unknown user"));
    };

    let Some(sub) = store.latest_subscription(user_id).await? else {
        return Ok(Outcome::Skipped("no subscription on record"));
    };

    let old_price_ref = sub.price_id.clone();
    let old_period_end = sub.current_period_end;

    let plan_name = match ev.price_nickname.clone() {
        Some(nickname) => Some(nickname),
        None => match ev.price_ref.as_deref() {
            Some(price_ref) => store
                .pricing_by_price_ref(price_ref)
                .await?
                .map(|p| p.plan_name),
            None => None,
        },
    };
    let status = ev.status.clone().unwrap_or_else(|| sub.status.clone());

    // Деньги считаются по состоянию ДО патча, а применяется всё одной
    // транзакцией в store: частично применённого события не бывает, при
    // ретрае после сбоя старый тариф ещё на месте и дельта считается заново.
    let mut delta = 0i64;
    let mut desc = "";
    let mut gate_period_end = None;

    if status == "active" {
        let old_pricing = match old_price_ref.as_deref() {
            Some(price_ref) => store.pricing_by_price_ref(price_ref).await?,
            None => None,
        };
        let new_pricing = match ev.price_ref.as_deref() {
            Some(price_ref) => store.pricing_by_price_ref(price_ref).await?,
            None => None,
        };

        if let (Some(old_pricing), Some(new_pricing)) = (old_pricing, new_pricing) {
            let is_renewal = matches!(
                (old_period_end, ev.current_period_end),
                (Some(old_end), Some(new_end)) if new_end > old_end
            );

            if is_renewal {
                // Награда за период не больше одного раза: гейт двигает
                // last_rewarded_period_end только вперёд, в той же транзакции.
                if let Some(new_end) = ev.current_period_end {
                    delta = new_pricing.coin_reward;
                    desc = RENEWAL_REWARD_DESC;
                    gate_period_end = Some(new_end);
                }
            } else if let (Some(start), Some(end)) =
                (ev.current_period_start, ev.current_period_end)
            {
                let ratio = remaining_ratio(start, end, now);
                delta = plan_change_delta(old_pricing.coin_reward, new_pricing.coin_reward, ratio);
                desc = PLAN_CHANGE_DESC;
            }
        }
    }

    let reward = (delta != 0 || gate_period_end.is_some()).then_some(RewardSpec {
        gate_period_end,
        credit: CreditSpec {
            coins: delta,
            source_type: "subscription",
            order_ref: ev.latest_invoice.as_deref(),
            subscription_ref: Some(&ev.subscription_ref),
            period_start: ev.current_period_start,
            period_end: ev.current_period_end,
            description: Some(desc),
        },
    });

    let rewarded = store
        .apply_subscription_event(
            sub.id,
            user_id,
            SubscriptionPatch {
                external_ref: &ev.subscription_ref,
                status: &status,
                price_ref: ev.price_ref.as_deref(),
                plan_name: plan_name.as_deref(),
                current_period_end: ev.current_period_end,
                order_ref: ev.latest_invoice.as_deref(),
            },
            reward,
        )
        .await?;

    if rewarded {
        log::info!(
            "subscription reward applied, event_id={} user_id={} delta={} desc={}",
            ev.event_id,
            user_id,
            delta,
            desc
        );
    }

    Ok(Outcome::Processed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::super::store::test::InMemoryStore;
    use super::super::store::SettledOrder;
    use crate::models::{PricingPlan, Subscription};

    use super::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, 0, 0, 0).unwrap()
    }

    fn seed_active_sub(
        store: &InMemoryStore,
        user_id: i64,
        customer_ref: &str,
        price_ref: &str,
        period_end: DateTime<Utc>,
    ) -> i64 {
        let id = 100;
        store.seed_subscription(Subscription {
            id,
            user_id,
            payment_customer_id: customer_ref.to_string(),
            subscription_id: "sub_1".to_string(),
            order_id: None,
            price_id: Some(price_ref.to_string()),
            plan_name: Some("Basic".to_string()),
            status: "active".to_string(),
            current_period_end: Some(period_end),
            start_date: Some(day(1)),
            last_rewarded_period_end: Some(period_end),
            total_coins_rewarded: 100,
        });
        id
    }

    fn change_event(event_id: &str, price_ref: &str) -> SubscriptionChange {
        SubscriptionChange {
            event_id: event_id.to_string(),
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: "sub_1".to_string(),
            status: Some("active".to_string()),
            price_ref: Some(price_ref.to_string()),
            price_nickname: None,
            current_period_start: Some(day(1)),
            current_period_end: Some(day(1) + chrono::Duration::days(30)),
            latest_invoice: Some("in_2".to_string()),
        }
    }

    #[test]
    fn remaining_ratio_covers_period_bounds() {
        let start = day(1);
        let end = day(1) + chrono::Duration::days(30);
        assert_eq!(remaining_ratio(start, end, start), 1.0);
        assert_eq!(remaining_ratio(start, end, end), 0.0);
        // После конца периода — 0, не отрицательное.
        assert_eq!(
            remaining_ratio(start, end, end + chrono::Duration::days(5)),
            0.0
        );
        // Вырожденный период считается как один день.
        assert_eq!(remaining_ratio(start, start, start), 1.0);
    }

    #[test]
    fn plan_change_delta_rounds_each_term() {
        // round(10 * 0.5) - round(5 * 0.5) = 5 - 3, а не round(2.5).
        assert_eq!(plan_change_delta(5, 10, 0.5), 2);
        assert_eq!(plan_change_delta(100, 500, 0.5), 200);
        assert_eq!(plan_change_delta(500, 100, 0.5), -200);
        assert_eq!(plan_change_delta(100, 100, 0.7), 0);
    }

    #[tokio::test]
    async fn one_time_checkout_credits_wallet_and_settles_order() {
        let store = InMemoryStore::new();
        store.seed_user(1, Some("a@b.c"), Some("cus_1"));
        store.seed_pricing("price_coins", "Coin Pack", 100, "One Time");
        store.seed_pending_order(1, "cus_1", None);

        let ev = OneTimeCheckout {
            event_id: "evt_1".to_string(),
            customer_ref: Some("cus_1".to_string()),
            email: None,
            price_ref: Some("price_coins".to_string()),
            settlement_ref: Some("pi_1".to_string()),
        };

        let outcome = reconcile_one_time_checkout(&store, ev.clone()).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), Some(100));

        let ledger = store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].transaction_type, "credit");
        assert_eq!(ledger[0].source_type, "coin_purchase");
        assert_eq!(ledger[0].order_ref.as_deref(), Some("pi_1"));

        let orders = store.orders();
        assert_eq!(orders[0].status, "success");
        assert_eq!(orders[0].order_ref.as_deref(), Some("pi_1"));

        // Повторная доставка ничего не меняет.
        let replay = reconcile_one_time_checkout(&store, ev).await.unwrap();
        assert_eq!(replay, Outcome::AlreadyProcessed);
        assert_eq!(store.balance(1), Some(100));
        assert_eq!(store.ledger().len(), 1);
    }

    #[tokio::test]
    async fn one_time_checkout_with_unknown_price_settles_without_coins() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pending_order(1, "cus_1", None);

        let outcome = reconcile_one_time_checkout(
            &store,
            OneTimeCheckout {
                event_id: "evt_1".to_string(),
                customer_ref: Some("cus_1".to_string()),
                email: None,
                price_ref: Some("price_unknown".to_string()),
                settlement_ref: Some("pi_1".to_string()),
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), Some(0));
        assert_eq!(store.orders()[0].status, "success");

        // Платёж без известного тарифа всё равно оставляет след в леджере.
        let ledger = store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].transaction_type, "credit");
        assert_eq!(ledger[0].coins, 0);
        assert_eq!(ledger[0].source_type, "coin_purchase");
    }

    #[tokio::test]
    async fn one_time_checkout_resolves_user_by_email_fallback() {
        let store = InMemoryStore::new();
        store.seed_user(1, Some("a@b.c"), None);
        store.seed_pricing("price_coins", "Coin Pack", 40, "One Time");

        let outcome = reconcile_one_time_checkout(
            &store,
            OneTimeCheckout {
                event_id: "evt_1".to_string(),
                customer_ref: Some("cus_new".to_string()),
                email: Some("a@b.c".to_string()),
                price_ref: Some("price_coins".to_string()),
                settlement_ref: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), Some(40));
    }

    #[tokio::test]
    async fn checkout_for_unknown_user_is_acknowledged_and_not_retried() {
        let store = InMemoryStore::new();

        let ev = OneTimeCheckout {
            event_id: "evt_1".to_string(),
            customer_ref: Some("cus_ghost".to_string()),
            email: None,
            price_ref: None,
            settlement_ref: None,
        };
        let outcome = reconcile_one_time_checkout(&store, ev.clone()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped("unknown user"));
        assert!(store.ledger().is_empty());

        let replay = reconcile_one_time_checkout(&store, ev).await.unwrap();
        assert_eq!(replay, Outcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn subscription_checkout_rewards_and_bumps_promo_once_per_order() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_m", "Basic", 100, "Monthly");
        store.seed_promo(7);
        store.seed_pending_order(1, "cus_1", Some(7));

        let ev = SubscriptionCheckout {
            event_id: "evt_1".to_string(),
            customer_ref: Some("cus_1".to_string()),
            email: None,
            subscription_ref: "sub_1".to_string(),
            price_ref: Some("price_m".to_string()),
            current_period_start: Some(day(1)),
            current_period_end: Some(day(1) + chrono::Duration::days(30)),
            latest_invoice: Some("in_1".to_string()),
        };
        let outcome = reconcile_subscription_checkout(&store, ev.clone()).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);

        assert_eq!(store.balance(1), Some(100));
        let ledger = store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].source_type, "subscription");
        assert_eq!(ledger[0].order_ref.as_deref(), Some("in_1"));
        assert_eq!(ledger[0].subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(store.orders()[0].status, "success");
        assert_eq!(store.promo_applied(7), 1);

        // Повтор того же события счётчик не двигает.
        let replay = reconcile_subscription_checkout(&store, ev).await.unwrap();
        assert_eq!(replay, Outcome::AlreadyProcessed);
        assert_eq!(store.promo_applied(7), 1);
        assert_eq!(store.balance(1), Some(100));

        // Новый заказ с тем же промо — счётчик растёт ещё раз.
        store.seed_pending_order(1, "cus_1", Some(7));
        reconcile_subscription_checkout(
            &store,
            SubscriptionCheckout {
                event_id: "evt_2".to_string(),
                customer_ref: Some("cus_1".to_string()),
                email: None,
                subscription_ref: "sub_1".to_string(),
                price_ref: Some("price_m".to_string()),
                current_period_start: Some(day(1)),
                current_period_end: Some(day(1) + chrono::Duration::days(30)),
                latest_invoice: Some("in_2".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(store.promo_applied(7), 2);
    }

    #[tokio::test]
    async fn subscription_checkout_without_pending_order_still_rewards() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_m", "Basic", 100, "Monthly");

        let outcome = reconcile_subscription_checkout(
            &store,
            SubscriptionCheckout {
                event_id: "evt_no_order".to_string(),
                customer_ref: Some("cus_1".to_string()),
                email: None,
                subscription_ref: "sub_1".to_string(),
                price_ref: Some("price_m".to_string()),
                current_period_start: Some(day(1)),
                current_period_end: Some(day(1) + chrono::Duration::days(30)),
                latest_invoice: Some("in_1".to_string()),
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), Some(100));
        assert!(store.orders().is_empty());
    }

    #[tokio::test]
    async fn renewal_rewards_at_most_once_per_period_end() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_m", "Basic", 100, "Monthly");
        let old_end = day(1) + chrono::Duration::days(30);
        let sub_id = seed_active_sub(&store, 1, "cus_1", "price_m", old_end);

        let mut ev = change_event("evt_1", "price_m");
        ev.current_period_start = Some(old_end);
        ev.current_period_end = Some(old_end + chrono::Duration::days(30));

        let outcome = reconcile_subscription_change(&store, ev.clone(), old_end).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), Some(100));
        let ledger = store.ledger();
        assert_eq!(ledger[0].description.as_deref(), Some(RENEWAL_REWARD_DESC));

        let sub = store.subscription(sub_id).unwrap();
        assert_eq!(sub.last_rewarded_period_end, ev.current_period_end);
        assert_eq!(sub.total_coins_rewarded, 200);

        // То же продление под другим event_id — награды нет.
        ev.event_id = "evt_1_dup".to_string();
        let second = reconcile_subscription_change(&store, ev, old_end).await.unwrap();
        assert_eq!(second, Outcome::Processed);
        assert_eq!(store.balance(1), Some(100));
        assert_eq!(store.ledger().len(), 1);
    }

    #[tokio::test]
    async fn late_event_for_already_rewarded_period_gives_nothing() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_m", "Basic", 100, "Monthly");
        let end = day(1) + chrono::Duration::days(30);
        let sub_id = seed_active_sub(&store, 1, "cus_1", "price_m", end);

        // Событие про уже вознаграждённый период, пришло с опозданием.
        let mut ev = change_event("evt_late", "price_m");
        ev.current_period_start = Some(day(1));
        ev.current_period_end = Some(end);

        let outcome = reconcile_subscription_change(&store, ev, day(20)).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(store.balance(1), None);
        assert!(store.ledger().is_empty());
        assert_eq!(
            store.subscription(sub_id).unwrap().last_rewarded_period_end,
            Some(end)
        );
    }

    #[tokio::test]
    async fn midpoint_upgrade_credits_prorated_delta() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_basic", "Basic", 100, "Monthly");
        store.seed_pricing("price_pro", "Pro", 500, "Monthly");
        let end = day(1) + chrono::Duration::days(30);
        let sub_id = seed_active_sub(&store, 1, "cus_1", "price_basic", end);

        let ev = change_event("evt_up", "price_pro");
        let now = day(1) + chrono::Duration::days(15);
        let outcome = reconcile_subscription_change(&store, ev, now).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);

        // ratio 0.5: round(500*0.5) - round(100*0.5) = 200.
        assert_eq!(store.balance(1), Some(200));
        let ledger = store.ledger();
        assert_eq!(ledger[0].transaction_type, "credit");
        assert_eq!(ledger[0].coins, 200);
        assert_eq!(ledger[0].description.as_deref(), Some(PLAN_CHANGE_DESC));

        let sub = store.subscription(sub_id).unwrap();
        assert_eq!(sub.total_coins_rewarded, 300);
        assert_eq!(sub.price_id.as_deref(), Some("price_pro"));
        assert_eq!(sub.last_rewarded_period_end, Some(end));
    }

    #[tokio::test]
    async fn midcycle_downgrade_can_drive_balance_negative() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_basic", "Basic", 100, "Monthly");
        store.seed_pricing("price_pro", "Pro", 500, "Monthly");
        store.seed_wallet(1, 50);
        let sub_id = seed_active_sub(
            &store,
            1,
            "cus_1",
            "price_pro",
            day(1) + chrono::Duration::days(30),
        );

        let ev = change_event("evt_down", "price_basic");
        let now = day(1) + chrono::Duration::days(15);
        reconcile_subscription_change(&store, ev, now).await.unwrap();

        assert_eq!(store.balance(1), Some(50 - 200));
        let ledger = store.ledger();
        assert_eq!(ledger[0].transaction_type, "debit");
        assert_eq!(ledger[0].coins, 200);
        assert_eq!(ledger[0].description.as_deref(), Some(PLAN_CHANGE_DESC));
        assert_eq!(store.subscription(sub_id).unwrap().total_coins_rewarded, -100);
    }

    #[tokio::test]
    async fn non_active_status_updates_record_without_reward() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));
        store.seed_pricing("price_m", "Basic", 100, "Monthly");
        let old_end = day(1) + chrono::Duration::days(30);
        let sub_id = seed_active_sub(&store, 1, "cus_1", "price_m", old_end);

        let mut ev = change_event("evt_cancel", "price_m");
        ev.status = Some("canceled".to_string());
        ev.current_period_end = Some(old_end + chrono::Duration::days(30));

        let outcome = reconcile_subscription_change(&store, ev, old_end).await.unwrap();
        assert_eq!(outcome, Outcome::Processed);
        assert!(store.ledger().is_empty());
        let sub = store.subscription(sub_id).unwrap();
        assert_eq!(sub.status, "canceled");
        assert_eq!(sub.last_rewarded_period_end, Some(old_end));
    }

    /// Обёртка над InMemoryStore: первые N вызовов заданного метода падают
    /// временной ошибкой, как при обрыве соединения с БД.
    struct FlakyStore {
        inner: InMemoryStore,
        credit_failures: AtomicU32,
        apply_failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(credit_failures: u32, apply_failures: u32) -> Self {
            Self {
                inner: InMemoryStore::new(),
                credit_failures: AtomicU32::new(credit_failures),
                apply_failures: AtomicU32::new(apply_failures),
            }
        }

        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BillingStore for FlakyStore {
        async fn try_begin_event(&self, event_id: &str) -> Result<bool, BillingError> {
            self.inner.try_begin_event(event_id).await
        }

        async fn release_event(&self, event_id: &str) -> Result<(), BillingError> {
            self.inner.release_event(event_id).await
        }

        async fn find_user(
            &self,
            customer_ref: Option<&str>,
            email: Option<&str>,
        ) -> Result<Option<i64>, BillingError> {
            self.inner.find_user(customer_ref, email).await
        }

        async fn attach_customer_ref(
            &self,
            user_id: i64,
            customer_ref: &str,
        ) -> Result<(), BillingError> {
            self.inner.attach_customer_ref(user_id, customer_ref).await
        }

        async fn pricing_by_price_ref(
            &self,
            price_ref: &str,
        ) -> Result<Option<PricingPlan>, BillingError> {
            self.inner.pricing_by_price_ref(price_ref).await
        }

        async fn wallet_balance(&self, user_id: i64) -> Result<Option<i64>, BillingError> {
            self.inner.wallet_balance(user_id).await
        }

        async fn debit_coins(
            &self,
            user_id: i64,
            coins: i64,
            source_type: &str,
            subscription_ref: &str,
        ) -> Result<bool, BillingError> {
            self.inner
                .debit_coins(user_id, coins, source_type, subscription_ref)
                .await
        }

        async fn credit_coins(
            &self,
            user_id: i64,
            spec: CreditSpec<'_>,
        ) -> Result<(), BillingError> {
            if Self::take_failure(&self.credit_failures) {
                return Err(BillingError::Db(sqlx::Error::PoolClosed.to_string()));
            }
            self.inner.credit_coins(user_id, spec).await
        }

        async fn latest_subscription(
            &self,
            user_id: i64,
        ) -> Result<Option<Subscription>, BillingError> {
            self.inner.latest_subscription(user_id).await
        }

        async fn subscription_by_customer_ref(
            &self,
            customer_ref: &str,
        ) -> Result<Option<Subscription>, BillingError> {
            self.inner.subscription_by_customer_ref(customer_ref).await
        }

        async fn upsert_subscription_from_checkout(
            &self,
            sub: &NewSubscription,
        ) -> Result<i64, BillingError> {
            self.inner.upsert_subscription_from_checkout(sub).await
        }

        async fn apply_subscription_event(
            &self,
            sub_id: i64,
            user_id: i64,
            patch: SubscriptionPatch<'_>,
            reward: Option<RewardSpec<'_>>,
        ) -> Result<bool, BillingError> {
            if Self::take_failure(&self.apply_failures) {
                return Err(BillingError::Db(sqlx::Error::PoolClosed.to_string()));
            }
            self.inner
                .apply_subscription_event(sub_id, user_id, patch, reward)
                .await
        }

        async fn settle_pending_order(
            &self,
            user_id: i64,
            customer_ref: &str,
            order_ref: Option<&str>,
            subscription_ref: Option<&str>,
        ) -> Result<Option<SettledOrder>, BillingError> {
            self.inner
                .settle_pending_order(user_id, customer_ref, order_ref, subscription_ref)
                .await
        }

        async fn increment_promo_applied(&self, promo_id: i64) -> Result<(), BillingError> {
            self.inner.increment_promo_applied(promo_id).await
        }
    }

    #[tokio::test]
    async fn transient_credit_failure_keeps_event_retryable() {
        let store = FlakyStore::new(1, 0);
        store.inner.seed_user(1, None, Some("cus_1"));
        store.inner.seed_pricing("price_coins", "Coin Pack", 100, "One Time");
        store.inner.seed_pending_order(1, "cus_1", None);

        let ev = OneTimeCheckout {
            event_id: "evt_flaky".to_string(),
            customer_ref: Some("cus_1".to_string()),
            email: None,
            price_ref: Some("price_coins".to_string()),
            settlement_ref: Some("pi_1".to_string()),
        };

        // Первая доставка падает на начислении: маркер снят, монет нет.
        assert!(reconcile_one_time_checkout(&store, ev.clone()).await.is_err());
        assert_eq!(store.inner.balance(1), None);
        assert!(store.inner.ledger().is_empty());

        // Ретрай того же события доводит платёж до конца.
        let retry = reconcile_one_time_checkout(&store, ev).await.unwrap();
        assert_eq!(retry, Outcome::Processed);
        assert_eq!(store.inner.balance(1), Some(100));
        assert_eq!(store.inner.ledger().len(), 1);
        assert_eq!(store.inner.orders()[0].status, "success");
    }

    #[tokio::test]
    async fn transient_failure_during_renewal_rewards_on_retry() {
        let store = FlakyStore::new(0, 1);
        store.inner.seed_user(1, None, Some("cus_1"));
        store.inner.seed_pricing("price_m", "Basic", 100, "Monthly");
        let old_end = day(1) + chrono::Duration::days(30);
        let sub_id = seed_active_sub(&store.inner, 1, "cus_1", "price_m", old_end);

        let mut ev = change_event("evt_flaky_renew", "price_m");
        ev.current_period_start = Some(old_end);
        ev.current_period_end = Some(old_end + chrono::Duration::days(30));

        // Сбой до коммита: гейт не сдвинут, патч не применён.
        assert!(reconcile_subscription_change(&store, ev.clone(), old_end)
            .await
            .is_err());
        let sub = store.inner.subscription(sub_id).unwrap();
        assert_eq!(sub.last_rewarded_period_end, Some(old_end));
        assert_eq!(store.inner.balance(1), None);

        let retry = reconcile_subscription_change(&store, ev.clone(), old_end)
            .await
            .unwrap();
        assert_eq!(retry, Outcome::Processed);
        assert_eq!(store.inner.balance(1), Some(100));
        assert_eq!(store.inner.ledger().len(), 1);
        assert_eq!(
            store.inner.subscription(sub_id).unwrap().last_rewarded_period_end,
            ev.current_period_end
        );
    }

    #[tokio::test]
    async fn change_without_local_subscription_is_skipped() {
        let store = InMemoryStore::new();
        store.seed_user(1, None, Some("cus_1"));

        let outcome =
            reconcile_subscription_change(&store, change_event("evt_x", "price_m"), day(10))
                .await
                .unwrap();
        assert_eq!(outcome, Outcome::Skipped("no subscription on record"));
        assert!(store.ledger().is_empty());
    }
}
