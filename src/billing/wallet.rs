// src/billing/wallet.rs
//
// Entitlement guard и списание монет. Проверка и списание намеренно разнесены:
// guard перед генерацией, debit только после её успеха (неудачная генерация
// не тарифицируется). Гонку между двумя параллельными запросами закрывает
// условный декремент в store.

use super::costs::{CostCache, Feature};
use super::error::BillingError;
use super::store::BillingStore;

/// Платёжная способность, определяется один раз на границе запроса.
/// Админы освобождены от оплаты целиком.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payer {
    Exempt,
    Billable(i64),
}

impl Payer {
    pub fn for_role(user_id: i64, role: &str) -> Self {
        if role.eq_ignore_ascii_case("admin") {
            Payer::Exempt
        } else {
            Payer::Billable(user_id)
        }
    }
}

/// Предполётная проверка: хватает ли монет на фичу.
pub async fn authorize(
    store: &impl BillingStore,
    costs: &CostCache,
    payer: Payer,
    feature: Feature,
) -> Result<(), BillingError> {
    let user_id = match payer {
        Payer::Exempt => return Ok(()),
        Payer::Billable(id) => id,
    };

    let cost = costs.cost_of(feature)?;
    let balance = store.wallet_balance(user_id).await?.unwrap_or(0);
    if balance < cost {
        return Err(BillingError::InsufficientCoins);
    }
    Ok(())
}

/// Списывает стоимость фичи после успешного действия.
/// Возвращает фактически списанную сумму.
pub async fn debit(
    store: &impl BillingStore,
    costs: &CostCache,
    payer: Payer,
    feature: Feature,
) -> Result<i64, BillingError> {
    let user_id = match payer {
        Payer::Exempt => return Ok(0),
        Payer::Billable(id) => id,
    };

    let cost = costs.cost_of(feature)?;
    if cost == 0 {
        return Ok(0);
    }

    let subscription_ref = match store.latest_subscription(user_id).await? {
        Some(sub) => sub.subscription_id,
        None => "free".to_string(),
    };

    // Ноль затронутых строк = баланса не хватило к моменту коммита
    // (параллельный запрос успел списать раньше).
    if !store
        .debit_coins(user_id, cost, feature.as_str(), &subscription_ref)
        .await?
    {
        return Err(BillingError::InsufficientCoins);
    }

    Ok(cost)
}
