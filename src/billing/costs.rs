// src/billing/costs.rs
//
// Стоимость фич в монетах. Значения лежат в таблице app_config и кешируются
// на весь процесс: читаем кеш на каждый запрос, перечитываем БД только по
// явному reload (admin endpoint). До первой загрузки любое чтение — ошибка.

use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::{PgPool, Row};

use super::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Chat,
    Image,
    Video,
    Character,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Chat => "chat",
            Feature::Image => "image",
            Feature::Video => "video",
            Feature::Character => "character",
        }
    }

    fn config_key(&self) -> &'static str {
        match self {
            Feature::Chat => "CHAT_COST",
            Feature::Image => "IMAGE_COST",
            Feature::Video => "VIDEO_COST",
            Feature::Character => "CHARACTER_COST",
        }
    }

    fn default_cost(&self) -> i64 {
        match self {
            Feature::Chat => 1,
            Feature::Image => 5,
            Feature::Video => 10,
            Feature::Character => 6,
        }
    }
}

#[derive(Default)]
pub struct CostCache {
    values: RwLock<Option<HashMap<String, String>>>,
}

impl CostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Перечитывает app_config целиком и заменяет кеш.
    pub async fn load(&self, pool: &PgPool) -> Result<(), BillingError> {
        let rows = sqlx::query("SELECT parameter_name, parameter_value FROM app_config")
            .fetch_all(pool)
            .await?;

        let map = rows
            .into_iter()
            .map(|r| (r.get("parameter_name"), r.get("parameter_value")))
            .collect();
        self.replace(map);
        Ok(())
    }

    pub fn replace(&self, map: HashMap<String, String>) {
        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(map);
    }

    /// Сырое строковое значение. None — ключа нет (это не ошибка).
    pub fn str_value(&self, key: &str) -> Result<Option<String>, BillingError> {
        let guard = self.values.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(map) => Ok(map.get(key).cloned()),
            None => Err(BillingError::CostCacheNotLoaded),
        }
    }

    /// Целочисленный параметр; отсутствие или мусор в значении -> default.
    pub fn int_value(&self, key: &str, default: i64) -> Result<i64, BillingError> {
        let raw = self.str_value(key)?;
        Ok(raw.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(default))
    }

    pub fn cost_of(&self, feature: Feature) -> Result<i64, BillingError> {
        self.int_value(feature.config_key(), feature.default_cost())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(pairs: &[(&str, &str)]) -> CostCache {
        let cache = CostCache::new();
        cache.replace(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        cache
    }

    #[test]
    fn read_before_load_fails() {
        let cache = CostCache::new();
        assert!(matches!(
            cache.cost_of(Feature::Chat),
            Err(BillingError::CostCacheNotLoaded)
        ));
    }

    #[test]
    fn configured_costs_win() {
        let cache = loaded(&[("CHAT_COST", "2"), ("VIDEO_COST", "25")]);
        assert_eq!(cache.cost_of(Feature::Chat).unwrap(), 2);
        assert_eq!(cache.cost_of(Feature::Video).unwrap(), 25);
    }

    #[test]
    fn absent_or_garbage_values_fall_back_to_defaults() {
        let cache = loaded(&[("IMAGE_COST", "not-a-number")]);
        assert_eq!(cache.cost_of(Feature::Chat).unwrap(), 1);
        assert_eq!(cache.cost_of(Feature::Character).unwrap(), 6);
        assert_eq!(cache.cost_of(Feature::Image).unwrap(), 5);
        assert_eq!(cache.cost_of(Feature::Video).unwrap(), 10);
    }

    #[test]
    fn reload_replaces_values() {
        let cache = loaded(&[("CHAT_COST", "2")]);
        assert_eq!(cache.cost_of(Feature::Chat).unwrap(), 2);
        cache.replace(HashMap::from([("CHAT_COST".to_string(), "3".to_string())]));
        assert_eq!(cache.cost_of(Feature::Chat).unwrap(), 3);
    }
}
