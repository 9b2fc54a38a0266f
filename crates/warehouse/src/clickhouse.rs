//! ClickHouse warehouse backend.
//!
//! Each tenant schema maps to a ClickHouse database. ClickHouse has no
//! multi-statement transactions, so outputs are built into `<name>__staging`
//! tables and swapped in with `EXCHANGE TABLES` on commit. Rollback drops the
//! staging tables; the previous outputs are never touched before commit.
//! Commit itself is not all-or-nothing: each swap is atomic, but the tables
//! are swapped one after another and grants run after the last swap, so a
//! failure part-way through leaves earlier tables published.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use clickhouse::{Client, Row};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use materializer_core::error::{QueryErrorCode, TransactionErrorCode};
use materializer_core::{
    Column, ColumnType, Error, LayoutHints, Relation, RelationRef, Result, Value,
};

use crate::config::WarehouseConfig;
use crate::ident;
use crate::store::{AccessGrantor, RelationStore, SchemaIntrospector, Warehouse, WarehouseTxn};

const STAGING_SUFFIX: &str = "__staging";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Column description from `system.columns`.
#[derive(Debug, Clone, Row, Deserialize)]
struct ColumnInfo {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

/// ClickHouse client wrapper.
#[derive(Clone)]
pub struct ClickHouseWarehouse {
    inner: Client,
    config: WarehouseConfig,
    locked: Arc<Mutex<HashSet<String>>>,
}

impl ClickHouseWarehouse {
    /// Creates a new ClickHouse client.
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        let url = config.http_url();
        let mut client = Client::default()
            .with_url(&url)
            .with_database(&config.database);

        if let Some(ref user) = config.username {
            client = client.with_user(user);
        }

        if let Some(ref pass) = config.password {
            client = client.with_password(pass);
        }

        info!(
            url = %url,
            database = %config.database,
            "Created ClickHouse client"
        );

        Ok(Self {
            inner: client,
            config,
            locked: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Returns the inner clickhouse client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }
}

#[async_trait]
impl Warehouse for ClickHouseWarehouse {
    fn backend(&self) -> &'static str {
        "clickhouse"
    }

    async fn ping(&self) -> Result<()> {
        self.inner
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn begin(&self, schema: &str) -> Result<Box<dyn WarehouseTxn>> {
        ident::plain(schema)?;
        if !self.locked.lock().insert(schema.to_string()) {
            return Err(Error::query(
                QueryErrorCode::LockConflict,
                format!("schema {} is being materialized by another run", schema),
            ));
        }
        debug!(schema = schema, "Opened ClickHouse staging scope");
        Ok(Box::new(ClickHouseTxn {
            client: self.inner.clone(),
            schema: schema.to_string(),
            batch_rows: self.config.batch_rows(),
            staged: Vec::new(),
            grants: Vec::new(),
            locked: self.locked.clone(),
        }))
    }
}

/// Staging scope over one ClickHouse schema.
struct ClickHouseTxn {
    client: Client,
    schema: String,
    batch_rows: usize,
    staged: Vec<RelationRef>,
    grants: Vec<(RelationRef, String)>,
    locked: Arc<Mutex<HashSet<String>>>,
}

impl ClickHouseTxn {
    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(sql = sql, "Executing ClickHouse statement");
        self.client.query(sql).execute().await.map_err(query_error)
    }

    /// The table currently holding `relation` from this scope's point of view.
    fn physical(&self, relation: &RelationRef) -> RelationRef {
        if self.staged.contains(relation) {
            staging(relation)
        } else {
            relation.clone()
        }
    }

    async fn exists(&self, relation: &RelationRef) -> Result<bool> {
        let sql = format!("EXISTS TABLE {}", ident::clickhouse_table(relation)?);
        let exists = self
            .client
            .query(&sql)
            .fetch_one::<u8>()
            .await
            .map_err(query_error)?;
        Ok(exists == 1)
    }

    async fn insert_chunk(&self, table: &str, columns: &[Column], rows: &[Vec<Value>]) -> Result<()> {
        let names = columns
            .iter()
            .map(|c| ident::backtick(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let structure = columns
            .iter()
            .map(|c| Ok(format!("{} {}", ident::backtick(&c.name)?, clickhouse_type(c))))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let mut payload = String::new();
        for row in rows {
            let object: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .zip(row)
                .map(|(c, v)| (c.name.clone(), v.to_json(TIMESTAMP_FORMAT)))
                .collect();
            payload.push_str(&serde_json::to_string(&object)?);
            payload.push('\n');
        }

        let sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM format(JSONEachRow, ?, ?)",
            table, names, names
        );
        self.client
            .query(&sql)
            .bind(structure)
            .bind(payload)
            .execute()
            .await
            .map_err(query_error)
    }

    async fn swap_in(&self, relation: &RelationRef) -> Result<()> {
        let target = ident::clickhouse_table(relation)?;
        let staged = ident::clickhouse_table(&staging(relation))?;
        if self.exists(relation).await? {
            self.execute(&format!("EXCHANGE TABLES {} AND {}", staged, target))
                .await?;
            self.execute(&format!("DROP TABLE IF EXISTS {}", staged)).await
        } else {
            self.execute(&format!("RENAME TABLE {} TO {}", staged, target))
                .await
        }
    }
}

#[async_trait]
impl SchemaIntrospector for ClickHouseTxn {
    async fn inspect(&mut self, relation: &RelationRef) -> Result<Vec<Column>> {
        let physical = self.physical(relation);
        let rows: Vec<ColumnInfo> = self
            .client
            .query(
                "SELECT name, type FROM system.columns WHERE database = ? AND table = ? ORDER BY position",
            )
            .bind(physical.schema.as_str())
            .bind(physical.name.as_str())
            .fetch_all()
            .await
            .map_err(query_error)?;

        if rows.is_empty() {
            return Err(Error::relation_not_found(relation));
        }

        Ok(rows
            .into_iter()
            .map(|info| {
                let (column_type, nullable) = parse_clickhouse_type(&info.column_type);
                Column {
                    name: info.name,
                    column_type,
                    nullable,
                }
            })
            .collect())
    }
}

#[async_trait]
impl RelationStore for ClickHouseTxn {
    async fn scan(&mut self, relation: &RelationRef) -> Result<Relation> {
        let columns = self.inspect(relation).await?;
        let sql = format!(
            "SELECT formatRowNoNewline('JSONEachRow', *) FROM {}",
            ident::clickhouse_table(&self.physical(relation))?
        );
        let lines: Vec<String> = self
            .client
            .query(&sql)
            .fetch_all()
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

        debug!(relation = %relation, rows = data.len(), "Scanned ClickHouse relation");
        Ok(data)
    }

    async fn create_or_replace(
        &mut self,
        relation: &RelationRef,
        data: &Relation,
        hints: &LayoutHints,
    ) -> Result<u64> {
        let staged = staging(relation);
        let table = ident::clickhouse_table(&staged)?;
        let ddl = create_table_sql(&table, &data.columns, hints)?;

        self.execute(&format!("DROP TABLE IF EXISTS {}", table)).await?;
        self.execute(&ddl).await?;

        for chunk in data.rows.chunks(self.batch_rows) {
            self.insert_chunk(&table, &data.columns, chunk).await?;
        }

        if !self.staged.contains(relation) {
            self.staged.push(relation.clone());
        }
        self.grants.retain(|(r, _)| r != relation);

        debug!(relation = %relation, rows = data.len(), "Staged ClickHouse relation");
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl AccessGrantor for ClickHouseTxn {
    async fn grant_select(&mut self, relation: &RelationRef, principal: &str) -> Result<()> {
        ident::plain(principal)?;
        // Applied after the swap so the grant lands on the published table.
        self.grants.push((relation.clone(), principal.to_string()));
        Ok(())
    }
}

#[async_trait]
impl WarehouseTxn for ClickHouseTxn {
    async fn commit(self: Box<Self>) -> Result<()> {
        for relation in &self.staged {
            self.swap_in(relation)
                .await
                .map_err(|e| commit_error(relation, e))?;
        }
        for (relation, principal) in &self.grants {
            let sql = format!(
                "GRANT SELECT ON {} TO {}",
                ident::clickhouse_table(relation)?,
                ident::plain(principal)?
            );
            self.execute(&sql)
                .await
                .map_err(|e| commit_error(relation, e))?;
        }
        info!(
            schema = %self.schema,
            relations = self.staged.len(),
            "Published ClickHouse relations"
        );
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        for relation in &self.staged {
            let sql = format!(
                "DROP TABLE IF EXISTS {}",
                ident::clickhouse_table(&staging(relation))?
            );
            self.execute(&sql).await.map_err(|e| {
                Error::transaction(
                    TransactionErrorCode::RollbackFailed,
                    format!("dropping staging table for {}: {}", relation, e),
                )
            })?;
        }
        Ok(())
    }
}

impl Drop for ClickHouseTxn {
    fn drop(&mut self) {
        // Staging tables left by an abandoned scope are dropped by the next create.
        self.locked.lock().remove(&self.schema);
    }
}

fn staging(relation: &RelationRef) -> RelationRef {
    RelationRef::new(
        relation.schema.clone(),
        format!("{}{}", relation.name, STAGING_SUFFIX),
    )
}

fn clickhouse_type(column: &Column) -> String {
    let base = match column.column_type {
        ColumnType::Text => "String",
        ColumnType::Integer => "Int64",
        ColumnType::Float => "Float64",
        ColumnType::Boolean => "Bool",
        ColumnType::Timestamp => "DateTime64(6, 'UTC')",
    };
    if column.nullable {
        format!("Nullable({})", base)
    } else {
        base.to_string()
    }
}

/// Maps a ClickHouse type name to a logical type and nullability.
fn parse_clickhouse_type(raw: &str) -> (ColumnType, bool) {
    let mut inner = raw.trim();
    let mut nullable = false;
    loop {
        if let Some(rest) = strip_wrapper(inner, "Nullable") {
            nullable = true;
            inner = rest;
        } else if let Some(rest) = strip_wrapper(inner, "LowCardinality") {
            inner = rest;
        } else {
            break;
        }
    }

    let column_type = if inner == "Bool" {
        ColumnType::Boolean
    } else if inner.starts_with("Int") || inner.starts_with("UInt") {
        ColumnType::Integer
    } else if inner.starts_with("Float") || inner.starts_with("Decimal") {
        ColumnType::Float
    } else if inner.starts_with("DateTime") || inner.starts_with("Date") {
        ColumnType::Timestamp
    } else {
        ColumnType::Text
    };
    (column_type, nullable)
}

fn strip_wrapper<'a>(raw: &'a str, wrapper: &str) -> Option<&'a str> {
    raw.strip_prefix(wrapper)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn create_table_sql(table: &str, columns: &[Column], hints: &LayoutHints) -> Result<String> {
    let defs = columns
        .iter()
        .map(|c| Ok(format!("{} {}", ident::backtick(&c.name)?, clickhouse_type(c))))
        .collect::<Result<Vec<_>>>()?
        .join(",\n    ");

    if let Some(ref key) = hints.distribution_key {
        debug!(key = %key, "ClickHouse has no per-table distribution key; hint ignored");
    }
    let order_by = match hints.sort_key {
        Some(ref key) => ident::backtick(key)?,
        None => "tuple()".to_string(),
    };

    Ok(format!(
        "CREATE TABLE {} (\n    {}\n)\nENGINE = MergeTree()\nORDER BY {}\nSETTINGS allow_nullable_key = 1",
        table, defs, order_by
    ))
}

fn query_error(e: clickhouse::error::Error) -> Error {
    let message = e.to_string();
    let code = if message.contains("ACCESS_DENIED") || message.contains("Code: 497") {
        QueryErrorCode::PrivilegeDenied
    } else {
        QueryErrorCode::Rejected
    };
    warn!(error = %message, "ClickHouse statement failed");
    Error::query(code, message)
}

fn commit_error(relation: &RelationRef, e: Error) -> Error {
    Error::transaction(
        TransactionErrorCode::CommitFailed,
        format!("publishing {}: {}", relation, e),
    )
}
