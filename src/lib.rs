//! Payment transaction engine for healthcare facilities.
//!
//! Payments for patient invoices move through a provider-agnostic lifecycle
//! (initiation, settlement, verification, reconciliation, refunds) across
//! card, mobile wallet, bank transfer and manual cash/cheque channels.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
