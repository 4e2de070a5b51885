// src/billing/error.rs

use std::fmt;

#[derive(Debug)]
pub enum BillingError {
    /// Баланса не хватает на операцию. Наружу — 402.
    InsufficientCoins,
    /// Кеш app_config не загружен до первого чтения.
    CostCacheNotLoaded,
    Db(String),
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingError::InsufficientCoins => write!(f, "insufficient coins"),
            BillingError::CostCacheNotLoaded => {
                write!(f, "config cache not loaded, call CostCache::load first")
            }
            BillingError::Db(e) => write!(f, "db error: {e}"),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(value: sqlx::Error) -> Self {
        Self::Db(value.to_string())
    }
}
