use sqlx::{PgPool, Row};

/// Whether the tenant is registered
pub async fn tenant_exists(pool: &PgPool, db_name: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM tenants WHERE db_name = $1) AS found")
        .bind(db_name)
        .fetch_one(pool)
        .await?;

    row.try_get("found")
}
