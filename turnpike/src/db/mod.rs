//! Database layer: error categorization, row models, and query handlers.
//!
//! Handlers use runtime-bound queries (`sqlx::query_as`) over `PgPool` or an
//! open transaction, so the crate builds without a live database. Schema
//! lives under `migrations/` and is applied at startup via [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;

pub use errors::{DbError, Result};
