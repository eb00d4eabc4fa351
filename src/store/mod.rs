mod memory;

pub use memory::{Evaluator, FaultPoint, MemoryStore};

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::relation::{Relation, Row, Value};
use crate::render::QueryText;

/// Snapshot of the store's tables handed to a query evaluator.
pub type Catalog = BTreeMap<String, Relation>;

/// The logical statements the materializer dispatches. The engine never
/// parses SQL; anything context-dependent was already substituted into the
/// query text by the renderer.
#[derive(Debug, Clone)]
pub enum Statement {
    /// Atomically replace a table with fully staged content.
    CreateOrReplaceTable { relation: String, content: Relation },
    /// Replace a view definition; evaluated on read.
    CreateOrReplaceView { relation: String, query: QueryText },
    /// Delete rows whose `column` value falls in `[low, high]`.
    DeleteKeyRange {
        relation: String,
        column: String,
        low: Value,
        high: Value,
    },
    /// Append rows to an existing table.
    Insert { relation: String, rows: Vec<Row> },
}

impl Statement {
    /// The relation this statement targets.
    pub fn relation(&self) -> &str {
        match self {
            Statement::CreateOrReplaceTable { relation, .. }
            | Statement::CreateOrReplaceView { relation, .. }
            | Statement::DeleteKeyRange { relation, .. }
            | Statement::Insert { relation, .. } => relation,
        }
    }
}

/// Capability set the materializer requires of a target store: evaluate a
/// query, execute a statement, read a watermark, and scope statements in a
/// transaction. Any relational engine or warehouse satisfying this works.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Evaluate rendered query text into rows without persisting anything.
    async fn query(&self, sql: &QueryText) -> Result<Relation>;

    /// Execute one statement; returns the affected row count.
    async fn execute(&self, stmt: Statement) -> Result<u64>;

    /// Open a transaction scoped to one relation. Until `commit`, statements
    /// against that relation stage invisibly to readers; statements against
    /// any other relation keep auto-committing as usual.
    async fn begin(&self, relation: &str) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Committed content of a relation; views are evaluated on read.
    async fn read_relation(&self, name: &str) -> Result<Option<Relation>>;

    /// Max committed value of `column` in `relation`, None when empty.
    async fn read_watermark(&self, relation: &str, column: &str) -> Result<Option<Value>>;
}
