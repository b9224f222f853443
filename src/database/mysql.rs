use super::catalog::Catalog;
use crate::config::MysqlConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool};
use tracing::debug;

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "sys"];
const ADMIN_SCHEMA: &str = "mysql";

pub struct MysqlCatalog {
    pool: Pool,
    config: MysqlConfig,
}

impl MysqlCatalog {
    pub fn new(config: &MysqlConfig) -> Self {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port.unwrap_or(3306))
            .user(Some(&config.user))
            .pass(config.password.as_deref())
            .db_name(Some("information_schema"))
            .into();

        Self {
            pool: Pool::new(opts),
            config: config.clone(),
        }
    }
}

pub fn filter_schemas(names: Vec<String>, config: &MysqlConfig) -> Vec<String> {
    names
        .into_iter()
        .filter(|db| {
            let lower = db.to_ascii_lowercase();
            !SYSTEM_SCHEMAS.contains(&lower.as_str())
                && !(config.exclude_mysql_schema && lower == ADMIN_SCHEMA)
                && !config.exclude.iter().any(|e| e == db)
        })
        .collect()
}

#[async_trait]
impl Catalog for MysqlCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        debug!("Listing schemas on {}", self.config.host);
        let mut conn = self.pool.get_conn().await?;
        let schemas: Vec<String> = conn
            .query("SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA")
            .await?;
        drop(conn);
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(BackupError::from)?;

        let filtered = filter_schemas(schemas, &self.config);
        debug!("Found {} user databases", filtered.len());
        Ok(filtered)
    }
}
