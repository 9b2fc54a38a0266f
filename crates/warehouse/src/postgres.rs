//! PostgreSQL warehouse backend.
//!
//! Every run is one database transaction. The per-schema lock is a
//! transaction-scoped advisory lock, so it is released on commit, rollback,
//! or when the connection drops.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, warn};

use materializer_core::error::{QueryErrorCode, TransactionErrorCode};
use materializer_core::{Column, ColumnType, Error, LayoutHints, Relation, RelationRef, Result, Value};

use crate::config::WarehouseConfig;
use crate::ident;
use crate::store::{AccessGrantor, RelationStore, SchemaIntrospector, Warehouse, WarehouseTxn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
    batch_rows: usize,
}

impl PostgresWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port())
            .database(&config.database);
        if let Some(ref user) = config.username {
            options = options.username(user);
        }
        if let Some(ref pass) = config.password {
            options = options.password(pass);
        }
        if config.tls {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.max(1) as u32)
            .acquire_timeout(Duration::from_secs(config.timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::transaction(
                    TransactionErrorCode::BeginFailed,
                    format!("connecting to PostgreSQL at {}: {}", config.host, e),
                )
            })?;

        info!(
            host = %config.host,
            port = config.port(),
            database = %config.database,
            pool_size = config.pool_size,
            "Created PostgreSQL pool"
        );

        Ok(Self {
            pool,
            batch_rows: config.batch_rows(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn begin(&self, schema: &str) -> Result<Box<dyn WarehouseTxn>> {
        ident::plain(schema)?;
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::transaction(
                TransactionErrorCode::BeginFailed,
                format!("opening transaction for {}: {}", schema, e),
            )
        })?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(schema)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error)?;
        if !acquired {
            return Err(Error::query(
                QueryErrorCode::LockConflict,
                format!("schema {} is being materialized by another run", schema),
            ));
        }

        debug!(schema = schema, "Opened PostgreSQL transaction");
        Ok(Box::new(PostgresTxn {
            tx,
            schema: schema.to_string(),
            batch_rows: self.batch_rows,
        }))
    }
}

struct PostgresTxn {
    tx: Transaction<'static, Postgres>,
    schema: String,
    batch_rows: usize,
}

impl PostgresTxn {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(sql = sql, "Executing PostgreSQL statement");
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map(|_| ())
            .map_err(query_error)
    }
}

#[async_trait]
impl SchemaIntrospector for PostgresTxn {
    async fn inspect(&mut self, relation: &RelationRef) -> Result<Vec<Column>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text, is_nullable::text \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(&relation.schema)
        .bind(&relation.name)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if rows.is_empty() {
            return Err(Error::relation_not_found(relation));
        }

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable)| Column {
                name,
                column_type: parse_postgres_type(&data_type),
                nullable: is_nullable != "NO",
            })
            .collect())
    }
}

#[async_trait]
impl RelationStore for PostgresTxn {
    async fn scan(&mut self, relation: &RelationRef) -> Result<Relation> {
        let columns = self.inspect(relation).await?;
        let sql = format!(
            "SELECT row_to_json(t)::text FROM {} t",
            ident::postgres_table(relation)?
        );
        let lines: Vec<String> = sqlx::query_scalar(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_error)?;

        let mut data = Relation::new(columns);
        for line in lines {
            let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&line)?;
            let row = data
                .columns
                .iter()
                .map(|c| {
                    object
                        .get(&c.name)
                        .map_or(Ok(Value::Null), |v| Value::from_json(v, c.column_type))
                })
                .collect::<Result<Vec<_>>>()?;
            data.rows.push(row);
        }

        debug!(relation = %relation, rows = data.len(), "Scanned PostgreSQL relation");
        Ok(data)
    }

    async fn create_or_replace(
        &mut self,
        relation: &RelationRef,
        data: &Relation,
        hints: &LayoutHints,
    ) -> Result<u64> {
        let table = ident::postgres_table(relation)?;
        let defs = data
            .columns
            .iter()
            .map(|c| Ok(format!("{} {}", ident::double_quote(&c.name)?, postgres_type(c))))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        if hints.distribution_key.is_some() || hints.sort_key.is_some() {
            debug!(relation = %relation, "PostgreSQL has no clustering keys; layout hints ignored");
        }

        self.execute(&format!("DROP TABLE IF EXISTS {}", table)).await?;
        self.execute(&format!("CREATE TABLE {} ({})", table, defs))
            .await?;

        let insert = format!(
            "INSERT INTO {} SELECT * FROM json_populate_recordset(NULL::{}, $1::json)",
            table, table
        );
        for chunk in data.rows.chunks(self.batch_rows) {
            let payload: Vec<serde_json::Value> = chunk
                .iter()
                .map(|row| {
                    serde_json::Value::Object(
                        data.columns
                            .iter()
                            .zip(row)
                            .map(|(c, v)| (c.name.clone(), v.to_json(TIMESTAMP_FORMAT)))
                            .collect(),
                    )
                })
                .collect();
            sqlx::query(&insert)
                .bind(serde_json::to_string(&payload)?)
                .execute(&mut *self.tx)
                .await
                .map_err(query_error)?;
        }

        Ok(data.len() as u64)
    }
}

#[async_trait]
impl AccessGrantor for PostgresTxn {
    async fn grant_select(&mut self, relation: &RelationRef, principal: &str) -> Result<()> {
        let sql = format!(
            "GRANT SELECT ON {} TO {}",
            ident::postgres_table(relation)?,
            ident::double_quote(ident::plain(principal)?)?
        );
        self.execute(&sql).await
    }
}

#[async_trait]
impl WarehouseTxn for PostgresTxn {
    async fn commit(self: Box<Self>) -> Result<()> {
        let schema = self.schema;
        self.tx.commit().await.map_err(|e| {
            Error::transaction(
                TransactionErrorCode::CommitFailed,
                format!("committing {}: {}", schema, e),
            )
        })?;
        debug!(schema = %schema, "Committed PostgreSQL transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let schema = self.schema;
        self.tx.rollback().await.map_err(|e| {
            Error::transaction(
                TransactionErrorCode::RollbackFailed,
                format!("rolling back {}: {}", schema, e),
            )
        })
    }
}

fn postgres_type(column: &Column) -> String {
    let base = match column.column_type {
        ColumnType::Text => "text",
        ColumnType::Integer => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Boolean => "boolean",
        ColumnType::Timestamp => "timestamp",
    };
    if column.nullable {
        base.to_string()
    } else {
        format!("{} NOT NULL", base)
    }
}

/// Maps an `information_schema` data type to a logical type.
fn parse_postgres_type(data_type: &str) -> ColumnType {
    match data_type {
        "smallint" | "integer" | "bigint" => ColumnType::Integer,
        "real" | "double precision" | "numeric" => ColumnType::Float,
        "boolean" => ColumnType::Boolean,
        t if t.starts_with("timestamp") || t == "date" => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

fn query_error(e: sqlx::Error) -> Error {
    let code = match e {
        sqlx::Error::Database(ref db) => match db.code().as_deref() {
            Some("42501") => QueryErrorCode::PrivilegeDenied,
            Some("55P03") => QueryErrorCode::LockConflict,
            _ => QueryErrorCode::Rejected,
        },
        _ => QueryErrorCode::Rejected,
    };
    warn!(error = %e, "PostgreSQL statement failed");
    Error::query(code, e.to_string())
}
