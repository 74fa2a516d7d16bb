//! Query handlers, one unit struct per entity.
//!
//! Handlers are stateless; each method borrows a pool or an open transaction.
//! Anything that must commit atomically with other writes takes
//! `&mut PgConnection` so callers decide the transaction boundary.

pub mod api_keys;
pub mod batches;
pub mod budgets;
pub mod catalog;
pub mod files;
pub mod guardrails;
pub mod tenants;
pub mod usage;

pub use api_keys::ApiKeys;
pub use batches::Batches;
pub use budgets::Budgets;
pub use catalog::Catalog;
pub use files::Files;
pub use guardrails::Guardrails;
pub use tenants::Tenants;
pub use usage::UsageRows;
