//! Customer reconciliation against the billing provider, with per-customer
//! health and churn-risk metrics and a daily analytics roll-up.

pub mod config;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod services;
pub mod startup;
