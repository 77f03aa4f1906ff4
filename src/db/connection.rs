//! Database connection management using sqlx

use crate::db::row::{decode_row, Row};
use crate::error::{AgentError, Result};
use crate::schema::{ColumnRecord, ForeignKey};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection as _, Row as _};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Something that can hand out a fresh connection per operation.
#[async_trait]
pub trait Database: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A single open connection. Each write is its own transaction.
#[async_trait]
pub trait Connection: Send {
    /// Run a read and return every row as an ordered column → value map.
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Run a write and commit it. Returns the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Foreign-key edges of `schema`, ordered by (table, column).
    async fn foreign_keys(&mut self, schema: &str) -> Result<Vec<ForeignKey>>;

    /// Column metadata of `schema`, ordered by (schema, table, ordinal position).
    async fn columns(&mut self, schema: &str) -> Result<Vec<ColumnRecord>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

const FOREIGN_KEY_QUERY: &str = r#"
    SELECT
        kcu.table_name::text AS fk_table,
        kcu.column_name::text AS fk_column,
        ccu.table_name::text AS referenced_table,
        ccu.column_name::text AS referenced_column
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name
     AND ccu.constraint_schema = tc.constraint_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
      AND tc.table_schema = $1
    ORDER BY kcu.table_name, kcu.column_name
"#;

const COLUMN_QUERY: &str = r#"
    SELECT
        table_schema::text AS table_schema,
        table_name::text AS table_name,
        column_name::text AS column_name,
        data_type::text AS data_type
    FROM information_schema.columns
    WHERE table_schema = $1
    ORDER BY table_schema, table_name, ordinal_position
"#;

/// PostgreSQL-backed database. Opens a new connection for every operation.
pub struct PgDatabase {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgDatabase {
    pub fn new(
        database_url: &str,
        connect_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| AgentError::Config(format!("Invalid DATABASE_URL: {}", e)))?
            .options([(
                "statement_timeout",
                statement_timeout.as_millis().to_string(),
            )]);

        Ok(Self {
            options,
            connect_timeout,
        })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| {
                AgentError::SqlExecution(format!(
                    "Timed out connecting to database after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(sql_error)?;

        Ok(Box::new(PgConn { conn }))
    }
}

struct PgConn {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PgConn {
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>> {
        let rows = sqlx::query(sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(sql_error)?;

        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut tx = self.conn.begin().await.map_err(sql_error)?;
        let done = sqlx::query(sql).execute(&mut *tx).await.map_err(sql_error)?;
        tx.commit().await.map_err(sql_error)?;

        Ok(done.rows_affected())
    }

    async fn foreign_keys(&mut self, schema: &str) -> Result<Vec<ForeignKey>> {
        let rows = sqlx::query(FOREIGN_KEY_QUERY)
            .bind(schema)
            .fetch_all(&mut self.conn)
            .await
            .map_err(schema_error)?;

        rows.iter()
            .map(|row| {
                Ok(ForeignKey {
                    table: row.try_get("fk_table").map_err(schema_error)?,
                    column: row.try_get("fk_column").map_err(schema_error)?,
                    referenced_table: row.try_get("referenced_table").map_err(schema_error)?,
                    referenced_column: row.try_get("referenced_column").map_err(schema_error)?,
                })
            })
            .collect()
    }

    async fn columns(&mut self, schema: &str) -> Result<Vec<ColumnRecord>> {
        let rows = sqlx::query(COLUMN_QUERY)
            .bind(schema)
            .fetch_all(&mut self.conn)
            .await
            .map_err(schema_error)?;

        rows.iter()
            .map(|row| {
                Ok(ColumnRecord {
                    schema: row.try_get("table_schema").map_err(schema_error)?,
                    table: row.try_get("table_name").map_err(schema_error)?,
                    name: row.try_get("column_name").map_err(schema_error)?,
                    data_type: row.try_get("data_type").map_err(schema_error)?,
                })
            })
            .collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PgConn { conn } = *self;
        if let Err(e) = conn.close().await {
            warn!("Failed to close database connection cleanly: {}", e);
        }
        Ok(())
    }
}

fn sql_error(e: sqlx::Error) -> AgentError {
    AgentError::SqlExecution(e.to_string())
}

fn schema_error(e: sqlx::Error) -> AgentError {
    AgentError::SchemaLoad(e.to_string())
}
