// src/api/mod.rs

pub mod admin;
pub mod auth;
pub mod checkout;
pub mod generate;
pub mod pricing;
pub mod subscriptions;
pub mod wallet;
pub mod webhooks;
