use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::catalog::CatalogEntry;

const CATALOG_COLUMNS: &str = "id, alias, provider, provider_model, deployment, endpoint, \
     api_key_ciphertext, api_version, region, modalities, supports_tools, \
     price_input, price_output, currency, weight, enabled, metadata_json, \
     provider_config_json, created_at, updated_at";

pub struct Catalog;

impl Catalog {
    /// Every enabled entry, ordered for deterministic route construction.
    pub async fn enabled_entries(pool: &PgPool) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query_as::<_, CatalogEntry>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM model_catalog WHERE enabled ORDER BY alias, created_at",
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Enabled entries for one alias; used for pricing lookups at record time.
    pub async fn enabled_entries_for_alias(pool: &PgPool, alias: &str) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query_as::<_, CatalogEntry>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM model_catalog WHERE enabled AND alias = $1 ORDER BY created_at",
        ))
        .bind(alias)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Distinct enabled aliases, newest first creation time per alias.
    pub async fn enabled_aliases(pool: &PgPool) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>)>> {
        let rows = sqlx::query_as::<_, (String, chrono::DateTime<chrono::Utc>)>(
            "SELECT alias, MIN(created_at) FROM model_catalog WHERE enabled GROUP BY alias ORDER BY alias",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
