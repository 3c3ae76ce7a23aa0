//! Catalog reprocessing orchestrator
//!
//! Starts one long-running transformation worker per tenant, records its
//! lifecycle and logs in a per-tenant job record, and lets clients stop it
//! cooperatively through a filesystem cancellation token.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
