//! Operator routes

pub mod alerts;
pub mod metrics;
pub mod reload;
