use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::error::{CtxDriftError, Result};
use crate::relation::{Relation, Value};
use crate::render::QueryText;

use super::{Catalog, Statement, TargetStore};

/// Resolves opaque query text into rows against a snapshot of the store's
/// tables. Tests and the CLI plug in their own; production deployments put a
/// real engine behind `TargetStore` instead.
pub type Evaluator = dyn Fn(&QueryText, &Catalog) -> Result<Relation> + Send + Sync;

/// Injectable failure points for exercising the merge and retry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    NextDelete,
    NextInsert,
    /// Fail this many upcoming watermark reads, then recover.
    WatermarkReads(u32),
}

#[derive(Clone)]
enum Stored {
    Table(Relation),
    View(QueryText),
}

struct Txn {
    /// The one relation this transaction owns; statements against any other
    /// relation bypass the staging area entirely.
    relation: String,
    staged: BTreeMap<String, Stored>,
    // Held for the lifetime of the transaction so merges serialize.
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
struct Faults {
    fail_next_delete: bool,
    fail_next_insert: bool,
    watermark_failures: u32,
}

struct Inner {
    committed: BTreeMap<String, Stored>,
    txn: Option<Txn>,
}

/// In-memory `TargetStore` with relation-scoped transactions. Readers always
/// see the last committed state; statements against the transaction's
/// relation apply to a staged copy that is written back on commit. Writes to
/// any other relation auto-commit even while a transaction is open, so
/// parallel builds never lose an unrelated unit's output.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    gate: Arc<tokio::sync::Mutex<()>>,
    evaluator: Box<Evaluator>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn with_evaluator(
        evaluator: impl Fn(&QueryText, &Catalog) -> Result<Relation> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                committed: BTreeMap::new(),
                txn: None,
            }),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            evaluator: Box::new(evaluator),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Store whose evaluator returns an empty relation for every query.
    /// Good enough to exercise scheduling and state transitions end to end.
    pub fn mock() -> Self {
        Self::with_evaluator(|_, _| Ok(Relation::default()))
    }

    /// Seed a source table directly into committed state.
    pub fn seed(&self, name: impl Into<String>, relation: Relation) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.committed.insert(name.into(), Stored::Table(relation));
    }

    pub fn inject_fault(&self, point: FaultPoint) {
        let mut faults = self.faults.lock().expect("fault lock");
        match point {
            FaultPoint::NextDelete => faults.fail_next_delete = true,
            FaultPoint::NextInsert => faults.fail_next_insert = true,
            FaultPoint::WatermarkReads(n) => faults.watermark_failures = n,
        }
    }

    pub fn relation_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store lock");
        inner.committed.keys().cloned().collect()
    }

    fn tables_snapshot(&self) -> Catalog {
        let inner = self.inner.lock().expect("store lock");
        inner
            .committed
            .iter()
            .filter_map(|(name, stored)| match stored {
                Stored::Table(rel) => Some((name.clone(), rel.clone())),
                Stored::View(_) => None,
            })
            .collect()
    }

    fn in_range(v: &Value, low: &Value, high: &Value) -> bool {
        matches!(
            v.partial_cmp_same(low),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ) && matches!(
            v.partial_cmp_same(high),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    fn apply(target: &mut BTreeMap<String, Stored>, stmt: Statement) -> Result<u64> {
        match stmt {
            Statement::CreateOrReplaceTable { relation, content } => {
                let rows = content.row_count() as u64;
                target.insert(relation, Stored::Table(content));
                Ok(rows)
            }
            Statement::CreateOrReplaceView { relation, query } => {
                target.insert(relation, Stored::View(query));
                Ok(0)
            }
            Statement::DeleteKeyRange {
                relation,
                column,
                low,
                high,
            } => match target.get_mut(&relation) {
                Some(Stored::Table(rel)) => {
                    let idx = rel.column_index(&column)?;
                    let before = rel.rows.len();
                    rel.rows.retain(|row| match row.get(idx) {
                        Some(v) => !Self::in_range(v, &low, &high),
                        None => true,
                    });
                    Ok((before - rel.rows.len()) as u64)
                }
                Some(Stored::View(_)) => Err(CtxDriftError::Store(format!(
                    "cannot delete from view '{}'",
                    relation
                ))),
                None => Err(CtxDriftError::RelationNotFound(relation)),
            },
            Statement::Insert { relation, rows } => match target.get_mut(&relation) {
                Some(Stored::Table(rel)) => {
                    let n = rows.len() as u64;
                    rel.rows.extend(rows);
                    Ok(n)
                }
                Some(Stored::View(_)) => Err(CtxDriftError::Store(format!(
                    "cannot insert into view '{}'",
                    relation
                ))),
                None => Err(CtxDriftError::RelationNotFound(relation)),
            },
        }
    }

    fn check_fault(&self, stmt: &Statement) -> Result<()> {
        let mut faults = self.faults.lock().expect("fault lock");
        match stmt {
            Statement::DeleteKeyRange { relation, .. } if faults.fail_next_delete => {
                faults.fail_next_delete = false;
                Err(CtxDriftError::Store(format!(
                    "injected delete failure on '{}'",
                    relation
                )))
            }
            Statement::Insert { relation, .. } if faults.fail_next_insert => {
                faults.fail_next_insert = false;
                Err(CtxDriftError::Store(format!(
                    "injected insert failure on '{}'",
                    relation
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn query(&self, sql: &QueryText) -> Result<Relation> {
        let catalog = self.tables_snapshot();
        (self.evaluator)(sql, &catalog)
    }

    async fn execute(&self, stmt: Statement) -> Result<u64> {
        self.check_fault(&stmt)?;
        let mut inner = self.inner.lock().expect("store lock");
        match inner.txn.as_mut() {
            // Only the transaction's own relation stages; anything else
            // auto-commits as if no transaction were open.
            Some(txn) if txn.relation == stmt.relation() => {
                Self::apply(&mut txn.staged, stmt)
            }
            _ => Self::apply(&mut inner.committed, stmt),
        }
    }

    async fn begin(&self, relation: &str) -> Result<()> {
        let guard = self.gate.clone().lock_owned().await;
        let mut inner = self.inner.lock().expect("store lock");
        if inner.txn.is_some() {
            return Err(CtxDriftError::Store("transaction already open".to_string()));
        }
        let mut staged = BTreeMap::new();
        if let Some(stored) = inner.committed.get(relation) {
            staged.insert(relation.to_string(), stored.clone());
        }
        inner.txn = Some(Txn {
            relation: relation.to_string(),
            staged,
            _guard: guard,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        match inner.txn.take() {
            Some(txn) => {
                // Write back only the staged relation; interleaved commits to
                // other relations stay untouched.
                for (name, stored) in txn.staged {
                    inner.committed.insert(name, stored);
                }
                Ok(())
            }
            None => Err(CtxDriftError::Store("no open transaction".to_string())),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        match inner.txn.take() {
            Some(_) => Ok(()),
            None => Err(CtxDriftError::Store("no open transaction".to_string())),
        }
    }

    async fn read_relation(&self, name: &str) -> Result<Option<Relation>> {
        let stored = {
            let inner = self.inner.lock().expect("store lock");
            inner.committed.get(name).cloned()
        };
        match stored {
            Some(Stored::Table(rel)) => Ok(Some(rel)),
            Some(Stored::View(query)) => {
                let catalog = self.tables_snapshot();
                (self.evaluator)(&query, &catalog).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn read_watermark(&self, relation: &str, column: &str) -> Result<Option<Value>> {
        {
            let mut faults = self.faults.lock().expect("fault lock");
            if faults.watermark_failures > 0 {
                faults.watermark_failures -= 1;
                return Err(CtxDriftError::Store(
                    "transient watermark read failure".to_string(),
                ));
            }
        }
        match self.read_relation(relation).await? {
            Some(rel) => rel.watermark(column),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(1998, 8, d).unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::mock();
        store.seed(
            "orders",
            Relation::with_rows(
                vec!["order_date".into(), "order_id".into()],
                vec![
                    vec![Value::Date(date(1)), Value::Int(1)],
                    vec![Value::Date(date(2)), Value::Int(2)],
                    vec![Value::Date(date(3)), Value::Int(3)],
                ],
            ),
        );
        store
    }

    #[tokio::test]
    async fn test_auto_commit_statements() {
        let store = seeded();
        let deleted = store
            .execute(Statement::DeleteKeyRange {
                relation: "orders".into(),
                column: "order_date".into(),
                low: Value::Date(date(2)),
                high: Value::Date(date(3)),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let rel = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(rel.row_count(), 1);
    }

    #[tokio::test]
    async fn test_readers_see_pre_merge_state_during_txn() {
        let store = seeded();
        store.begin("orders").await.unwrap();
        store
            .execute(Statement::DeleteKeyRange {
                relation: "orders".into(),
                column: "order_date".into(),
                low: Value::Date(date(1)),
                high: Value::Date(date(3)),
            })
            .await
            .unwrap();

        // Concurrent reader: still the committed (pre-merge) content.
        let rel = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(rel.row_count(), 3);

        store.commit().await.unwrap();
        let rel = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(rel.row_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_committed_state() {
        let store = seeded();
        store.begin("orders").await.unwrap();
        store
            .execute(Statement::Insert {
                relation: "orders".into(),
                rows: vec![vec![Value::Date(date(4)), Value::Int(4)]],
            })
            .await
            .unwrap();
        store.rollback().await.unwrap();

        let rel = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(rel.row_count(), 3);
    }

    #[tokio::test]
    async fn test_open_txn_does_not_capture_other_relations() {
        let store = seeded();
        store.begin("orders").await.unwrap();
        store
            .execute(Statement::Insert {
                relation: "orders".into(),
                rows: vec![vec![Value::Date(date(4)), Value::Int(4)]],
            })
            .await
            .unwrap();

        // A write to an unrelated relation while the merge is open must land
        // in committed state immediately, not inside the staging area.
        store
            .execute(Statement::CreateOrReplaceTable {
                relation: "all_orders".into(),
                content: Relation::with_rows(
                    vec!["order_id".into()],
                    vec![vec![Value::Int(1)]],
                ),
            })
            .await
            .unwrap();
        assert!(store.read_relation("all_orders").await.unwrap().is_some());

        // Rolling back the merge discards only its own relation's changes.
        store.rollback().await.unwrap();
        assert!(store.read_relation("all_orders").await.unwrap().is_some());
        let orders = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(orders.row_count(), 3);
    }

    #[tokio::test]
    async fn test_commit_preserves_interleaved_writes() {
        let store = seeded();
        store.begin("orders").await.unwrap();
        store
            .execute(Statement::Insert {
                relation: "orders".into(),
                rows: vec![vec![Value::Date(date(4)), Value::Int(4)]],
            })
            .await
            .unwrap();
        store
            .execute(Statement::CreateOrReplaceTable {
                relation: "all_orders".into(),
                content: Relation::with_rows(
                    vec!["order_id".into()],
                    vec![vec![Value::Int(1)]],
                ),
            })
            .await
            .unwrap();
        store.commit().await.unwrap();

        // Commit writes back the merged relation without clobbering the
        // relation committed mid-transaction.
        let orders = store.read_relation("orders").await.unwrap().unwrap();
        assert_eq!(orders.row_count(), 4);
        let all = store.read_relation("all_orders").await.unwrap().unwrap();
        assert_eq!(all.row_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_insert_fault_fires_once() {
        let store = seeded();
        store.inject_fault(FaultPoint::NextInsert);

        let stmt = Statement::Insert {
            relation: "orders".into(),
            rows: vec![vec![Value::Date(date(5)), Value::Int(5)]],
        };
        assert!(store.execute(stmt.clone()).await.is_err());
        assert!(store.execute(stmt).await.is_ok());
    }

    #[tokio::test]
    async fn test_watermark_faults_then_recover() {
        let store = seeded();
        store.inject_fault(FaultPoint::WatermarkReads(2));

        assert!(store.read_watermark("orders", "order_date").await.is_err());
        assert!(store.read_watermark("orders", "order_date").await.is_err());
        let wm = store.read_watermark("orders", "order_date").await.unwrap();
        assert_eq!(wm, Some(Value::Date(date(3))));
    }

    #[tokio::test]
    async fn test_view_evaluated_on_read() {
        let store = MemoryStore::with_evaluator(|sql, catalog| {
            assert_eq!(sql.as_str(), "SELECT * FROM orders");
            Ok(catalog.get("orders").cloned().unwrap_or_default())
        });
        store.seed("orders", Relation::new(vec!["order_id".into()]));
        store
            .execute(Statement::CreateOrReplaceView {
                relation: "orders_v".into(),
                query: QueryText::new("SELECT * FROM orders"),
            })
            .await
            .unwrap();

        let rel = store.read_relation("orders_v").await.unwrap().unwrap();
        assert_eq!(rel.columns, vec!["order_id".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_into_missing_relation_errors() {
        let store = MemoryStore::mock();
        let err = store
            .execute(Statement::Insert {
                relation: "nope".into(),
                rows: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CtxDriftError::RelationNotFound(_)));
    }
}
