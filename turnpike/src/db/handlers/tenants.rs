use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::tenants::Tenant;
use crate::types::TenantId;

pub struct Tenants;

impl Tenants {
    pub async fn get(pool: &PgPool, id: TenantId) -> Result<Tenant> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, status, kind, allowed_aliases, created_at, updated_at
             FROM tenants WHERE id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(tenant)
    }
}
