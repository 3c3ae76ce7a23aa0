use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;

use crate::db::tenant_queries;

/// Lookup of tenants known to the wider system.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn exists(&self, db_name: &str) -> Result<bool, TenantError>;
}

/// Tenants registered in the `tenants` table.
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn exists(&self, db_name: &str) -> Result<bool, TenantError> {
        Ok(tenant_queries::tenant_exists(&self.pool, db_name).await?)
    }
}

/// Fixed tenant list, configured at startup.
#[derive(Debug, Default)]
pub struct StaticTenantDirectory {
    tenants: HashSet<String>,
}

impl StaticTenantDirectory {
    pub fn new<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenants: tenants.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn exists(&self, db_name: &str) -> Result<bool, TenantError> {
        Ok(self.tenants.contains(db_name))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("Tenant lookup failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticTenantDirectory::new(["shop-a", "shop-b"]);
        assert!(directory.exists("shop-a").await.unwrap());
        assert!(!directory.exists("shop-z").await.unwrap());
    }
}
