//! Session and operation lifecycle management for a multi-tenant SQL
//! gateway.
//!
//! Clients open long-lived sessions through a [`manager::SessionManager`],
//! execute statements as tracked [`operation::Operation`]s against pooled,
//! identity-scoped engines, and page through results. The wire protocol and
//! the engine itself live elsewhere; this crate owns the lifecycle glue in
//! between.

pub mod engine;
pub mod engine_cache;
pub mod errors;
pub mod handle;
pub mod manager;
pub mod operation;
pub mod operations;
pub mod session;
pub mod statement;
pub mod types;

mod reaper;
