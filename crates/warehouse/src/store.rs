//! Storage capabilities the materializer needs from a warehouse.
//!
//! A [`WarehouseTxn`] is one transactional scope bound to one connection.
//! It is the explicit context value passed to every stage of a run.

use async_trait::async_trait;
use materializer_core::{Column, LayoutHints, Relation, RelationRef, Result};

/// Discovers the columns of a relation.
#[async_trait]
pub trait SchemaIntrospector {
    /// Ordered `(name, type)` columns. Fails with `SCHEMA_001` if the relation does not exist.
    async fn inspect(&mut self, relation: &RelationRef) -> Result<Vec<Column>>;
}

/// Reads relations and replaces them in place.
#[async_trait]
pub trait RelationStore {
    /// Reads every row of a relation.
    async fn scan(&mut self, relation: &RelationRef) -> Result<Relation>;

    /// Destroys any prior version of `relation`, then creates and populates it.
    ///
    /// Backends without clustering controls ignore `hints`. Returns rows written.
    async fn create_or_replace(
        &mut self,
        relation: &RelationRef,
        data: &Relation,
        hints: &LayoutHints,
    ) -> Result<u64>;
}

/// Grants read access. Granting twice is a no-op.
#[async_trait]
pub trait AccessGrantor {
    async fn grant_select(&mut self, relation: &RelationRef, principal: &str) -> Result<()>;
}

/// One open transaction holding the per-schema lock until it ends.
#[async_trait]
pub trait WarehouseTxn: SchemaIntrospector + RelationStore + AccessGrantor + Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A warehouse connection factory.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Opens a transaction and takes the exclusive lock on `schema`.
    ///
    /// Fails with `QUERY_003` when another run holds the lock.
    async fn begin(&self, schema: &str) -> Result<Box<dyn WarehouseTxn>>;
}
