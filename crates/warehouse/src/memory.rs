//! In-process warehouse.
//!
//! Writes and grants are staged inside the transaction and published together
//! on commit, so readers never see a partially materialized schema.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use materializer_core::error::QueryErrorCode;
use materializer_core::{Column, Error, LayoutHints, Relation, RelationRef, Result};

use crate::store::{AccessGrantor, RelationStore, SchemaIntrospector, Warehouse, WarehouseTxn};

#[derive(Debug, Clone)]
struct StoredTable {
    data: Relation,
    hints: Option<LayoutHints>,
    grants: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<RelationRef, StoredTable>,
    locked: HashSet<String>,
}

/// Warehouse held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a relation outside any transaction (seeding raw sources).
    pub fn put(&self, relation: RelationRef, data: Relation) {
        self.state.lock().tables.insert(
            relation,
            StoredTable {
                data,
                hints: None,
                grants: BTreeSet::new(),
            },
        );
    }

    /// Committed contents of a relation.
    pub fn get(&self, relation: &RelationRef) -> Option<Relation> {
        self.state.lock().tables.get(relation).map(|t| t.data.clone())
    }

    pub fn contains(&self, relation: &RelationRef) -> bool {
        self.state.lock().tables.contains_key(relation)
    }

    /// Principals holding read access on a committed relation.
    pub fn grants(&self, relation: &RelationRef) -> BTreeSet<String> {
        self.state
            .lock()
            .tables
            .get(relation)
            .map(|t| t.grants.clone())
            .unwrap_or_default()
    }

    /// Layout hints recorded when the relation was last created.
    pub fn layout_hints(&self, relation: &RelationRef) -> Option<LayoutHints> {
        self.state
            .lock()
            .tables
            .get(relation)
            .and_then(|t| t.hints.clone())
    }

    pub fn is_locked(&self, schema: &str) -> bool {
        self.state.lock().locked.contains(schema)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self, schema: &str) -> Result<Box<dyn WarehouseTxn>> {
        let mut state = self.state.lock();
        if !state.locked.insert(schema.to_string()) {
            return Err(Error::query(
                QueryErrorCode::LockConflict,
                format!("schema {} is being materialized by another run", schema),
            ));
        }
        debug!(schema = schema, "Opened memory transaction");
        Ok(Box::new(MemoryTxn {
            state: self.state.clone(),
            schema: schema.to_string(),
            staged: BTreeMap::new(),
            grants: Vec::new(),
        }))
    }
}

/// Transaction over a [`MemoryWarehouse`]; releases the schema lock when dropped.
struct MemoryTxn {
    state: Arc<Mutex<State>>,
    schema: String,
    staged: BTreeMap<RelationRef, StoredTable>,
    grants: Vec<(RelationRef, String)>,
}

impl MemoryTxn {
    fn visible(&self, relation: &RelationRef) -> Option<StoredTable> {
        self.staged
            .get(relation)
            .cloned()
            .or_else(|| self.state.lock().tables.get(relation).cloned())
    }
}

#[async_trait]
impl SchemaIntrospector for MemoryTxn {
    async fn inspect(&mut self, relation: &RelationRef) -> Result<Vec<Column>> {
        self.visible(relation)
            .map(|t| t.data.columns)
            .ok_or_else(|| Error::relation_not_found(relation))
    }
}

#[async_trait]
impl RelationStore for MemoryTxn {
    async fn scan(&mut self, relation: &RelationRef) -> Result<Relation> {
        self.visible(relation)
            .map(|t| t.data)
            .ok_or_else(|| Error::relation_not_found(relation))
    }

    async fn create_or_replace(
        &mut self,
        relation: &RelationRef,
        data: &Relation,
        hints: &LayoutHints,
    ) -> Result<u64> {
        self.staged.insert(
            relation.clone(),
            StoredTable {
                data: data.clone(),
                hints: Some(hints.clone()),
                grants: BTreeSet::new(),
            },
        );
        // Grants made earlier in this transaction targeted the replaced table.
        self.grants.retain(|(r, _)| r != relation);
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl AccessGrantor for MemoryTxn {
    async fn grant_select(&mut self, relation: &RelationRef, principal: &str) -> Result<()> {
        if self.visible(relation).is_none() {
            return Err(Error::relation_not_found(relation));
        }
        self.grants.push((relation.clone(), principal.to_string()));
        Ok(())
    }
}

#[async_trait]
impl WarehouseTxn for MemoryTxn {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let staged = std::mem::take(&mut this.staged);
        let grants = std::mem::take(&mut this.grants);
        let mut state = this.state.lock();
        for (relation, table) in staged {
            state.tables.insert(relation, table);
        }
        for (relation, principal) in grants {
            if let Some(table) = state.tables.get_mut(&relation) {
                table.grants.insert(principal);
            }
        }
        drop(state);
        debug!(schema = %this.schema, "Committed memory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(
            schema = %self.schema,
            discarded = self.staged.len(),
            "Rolled back memory transaction"
        );
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        self.state.lock().locked.remove(&self.schema);
    }
}
