// src/billing/mod.rs
//
// Монетная экономика: кошельки, леджер, стоимость фич, сверка Stripe-событий.

pub mod costs;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod signature;
pub mod store;
pub mod wallet;

pub use costs::{CostCache, Feature};
pub use error::BillingError;
pub use wallet::Payer;
