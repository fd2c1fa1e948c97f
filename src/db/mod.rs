//! Per-project connection pools and schema bootstrap for the
//! Postgres-compatible relational + vector store (spec.md §4.5, §6).
//!
//! One [`PgPool`] is kept per project schema — "a per-project
//! connection pool... every checkout first sets the project schema on
//! the connection" (spec.md §5) is implemented by having each pool's
//! `after_connect` hook run `SET search_path` once, at connection
//! establishment, rather than re-setting it per query.

use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;

pub mod schema;

/// Arena of per-project pools, keyed by schema name — the "global
/// singletons retained as a map keyed by project path" pattern
/// (spec.md §9), generalized here to Postgres connection pools with
/// lifetime = explicit process shutdown.
pub struct PoolManager {
    database_url: String,
    pools: DashMap<String, PgPool>,
}

impl PoolManager {
    pub fn new(database_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            database_url: database_url.into(),
            pools: DashMap::new(),
        })
    }

    /// Returns the pool for `project_path`'s schema, creating and
    /// bootstrapping it on first use.
    pub async fn pool_for(&self, project_path: &str) -> anyhow::Result<PgPool> {
        let schema_name = specmem_core::project::schema_name(project_path);
        if let Some(pool) = self.pools.get(&schema_name) {
            return Ok(pool.clone());
        }

        let pool = self.connect_with_schema(&schema_name).await?;
        schema::bootstrap(&pool, &schema_name, project_path).await?;
        self.pools.insert(schema_name, pool.clone());
        Ok(pool)
    }

    async fn connect_with_schema(&self, schema_name: &str) -> anyhow::Result<PgPool> {
        anyhow::ensure!(
            is_safe_identifier(schema_name),
            "refusing to use unsafe schema name: {schema_name}"
        );
        let schema_owned = schema_name.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_owned.clone();
                Box::pin(async move {
                    conn.execute(format!("SET search_path = {schema}, public").as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect(&self.database_url)
            .await?;
        Ok(pool)
    }
}

/// The single documented exception to "no string concatenation in
/// SQL" (spec.md §9) requires this guard: schema names are always
/// produced by [`specmem_core::project::schema_name`], but we verify
/// the invariant holds before ever splicing one into a statement.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_from_the_pure_function_are_always_safe() {
        let name = specmem_core::project::schema_name("/some/weird path!@#");
        assert!(is_safe_identifier(&name));
    }

    #[test]
    fn rejects_identifiers_with_sql_metacharacters() {
        assert!(!is_safe_identifier("public; DROP TABLE memories;--"));
        assert!(!is_safe_identifier(""));
    }
}
