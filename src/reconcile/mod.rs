use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::classify::{Classification, Classifier, Verdict};
use crate::context::{Context, ContextVar};
use crate::error::Result;
use crate::registry::{Unit, UnitRegistry};
use crate::relation::{Relation, Row};
use crate::store::TargetStore;

/// How a reported difference should be treated downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Genuine data or logic change.
    Alarm,
    /// Surfaced but unattributable to data change, or no difference at all.
    Informational,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedRow {
    pub key: String,
    pub before: Row,
    pub after: Row,
}

/// Outcome of comparing one unit's materialized output under two contexts.
/// Differences are never dropped; the attribution explains how to read them.
#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub unit: String,
    pub added_rows: Vec<Row>,
    pub removed_rows: Vec<Row>,
    pub changed_rows: Vec<ChangedRow>,
    pub row_count_a: usize,
    pub row_count_b: usize,
    pub attribution: Verdict,
    /// The declared context variable behind a CONTEXT_SENSITIVE verdict.
    pub cause: Option<ContextVar>,
    pub severity: Severity,
    /// Plain-language attribution basis, always populated.
    pub basis: String,
}

impl DiffReport {
    pub fn has_differences(&self) -> bool {
        !self.added_rows.is_empty()
            || !self.removed_rows.is_empty()
            || !self.changed_rows.is_empty()
    }

    pub fn is_alarm(&self) -> bool {
        self.severity == Severity::Alarm
    }
}

pub struct DiffReconciler;

impl DiffReconciler {
    /// Attribute the difference between two materialized relations using
    /// the classifier's verdict for the pair of contexts that produced
    /// them.
    pub fn reconcile(
        unit: &Unit,
        relation_a: &Relation,
        relation_b: &Relation,
        classification: &Classification,
    ) -> DiffReport {
        let (added_rows, removed_rows, changed_rows) =
            Self::diff_rows(unit, relation_a, relation_b);

        let has_diff =
            !added_rows.is_empty() || !removed_rows.is_empty() || !changed_rows.is_empty();

        let (severity, basis) = match (has_diff, classification.verdict) {
            (false, _) => (
                Severity::Informational,
                "relations are identical for both contexts".to_string(),
            ),
            (true, Verdict::Deterministic) => (
                Severity::Alarm,
                "unit renders identically for both contexts; the difference reflects \
                 genuine data or logic change"
                    .to_string(),
            ),
            (true, Verdict::ContextSensitive) => {
                let cause = classification
                    .cause
                    .map(|c| c.as_str())
                    .unwrap_or("unknown");
                (
                    Severity::Informational,
                    format!(
                        "difference unattributable to data change: the render function \
                         consults '{}', so outputs under differing contexts are not \
                         comparable; downgraded from alarm",
                        cause
                    ),
                )
            }
        };

        DiffReport {
            unit: unit.name.clone(),
            added_rows,
            removed_rows,
            changed_rows,
            row_count_a: relation_a.row_count(),
            row_count_b: relation_b.row_count(),
            attribution: classification.verdict,
            cause: classification.cause,
            severity,
            basis,
        }
    }

    fn diff_rows(
        unit: &Unit,
        a: &Relation,
        b: &Relation,
    ) -> (Vec<Row>, Vec<Row>, Vec<ChangedRow>) {
        let columns = if a.columns.is_empty() {
            &b.columns
        } else {
            &a.columns
        };
        let key_indexes: Option<Vec<usize>> = if unit.unique_key.is_empty() {
            None
        } else {
            unit.unique_key
                .iter()
                .map(|k| columns.iter().position(|c| c == k))
                .collect()
        };

        match key_indexes {
            Some(idxs) if !idxs.is_empty() => Self::diff_by_key(a, b, &idxs),
            // No usable key: compare whole rows as multisets.
            _ => Self::diff_whole_rows(a, b),
        }
    }

    fn diff_by_key(a: &Relation, b: &Relation, idxs: &[usize]) -> (Vec<Row>, Vec<Row>, Vec<ChangedRow>) {
        let map_a: BTreeMap<String, &Row> = a
            .rows
            .iter()
            .map(|r| (Relation::key_of(r, idxs), r))
            .collect();
        let map_b: BTreeMap<String, &Row> = b
            .rows
            .iter()
            .map(|r| (Relation::key_of(r, idxs), r))
            .collect();

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (key, row_b) in &map_b {
            match map_a.get(key) {
                None => added.push((*row_b).clone()),
                Some(row_a) if row_a != row_b => changed.push(ChangedRow {
                    key: key.clone(),
                    before: (*row_a).clone(),
                    after: (*row_b).clone(),
                }),
                Some(_) => {}
            }
        }
        for (key, row_a) in &map_a {
            if !map_b.contains_key(key) {
                removed.push((*row_a).clone());
            }
        }

        (added, removed, changed)
    }

    fn diff_whole_rows(a: &Relation, b: &Relation) -> (Vec<Row>, Vec<Row>, Vec<ChangedRow>) {
        let mut counts: BTreeMap<String, (i64, Row)> = BTreeMap::new();
        for row in &a.rows {
            let key = Relation::key_of(row, &(0..row.len()).collect::<Vec<_>>());
            counts.entry(key).or_insert((0, row.clone())).0 -= 1;
        }
        for row in &b.rows {
            let key = Relation::key_of(row, &(0..row.len()).collect::<Vec<_>>());
            counts.entry(key).or_insert((0, row.clone())).0 += 1;
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        for (_, (delta, sample)) in counts {
            for _ in 0..delta.abs() {
                if delta > 0 {
                    added.push(sample.clone());
                } else {
                    removed.push(sample.clone());
                }
            }
        }
        (added, removed, Vec::new())
    }
}

/// The diff invocation surface: materialized outputs of one unit under two
/// contexts, attributed by a fresh classification of the pair.
pub struct DiffRunner {
    registry: Arc<UnitRegistry>,
    classifier: Classifier,
}

impl DiffRunner {
    pub fn new(registry: Arc<UnitRegistry>) -> Self {
        Self {
            registry,
            classifier: Classifier::new(),
        }
    }

    pub async fn run_diff(
        &self,
        unit_name: &str,
        ctx_a: &Context,
        store_a: &Arc<dyn TargetStore>,
        ctx_b: &Context,
        store_b: &Arc<dyn TargetStore>,
    ) -> Result<DiffReport> {
        let unit = self.registry.get(unit_name)?;

        let relation_a = store_a
            .read_relation(unit_name)
            .await?
            .unwrap_or_default();
        let relation_b = store_b
            .read_relation(unit_name)
            .await?
            .unwrap_or_default();

        // Verdicts are computed fresh per comparison, never persisted.
        let classification = self.classifier.classify_pair(&unit, ctx_a, ctx_b)?;

        let report =
            DiffReconciler::reconcile(&unit, &relation_a, &relation_b, &classification);
        info!(
            unit = unit_name,
            attribution = %report.attribution,
            severity = ?report.severity,
            added = report.added_rows.len(),
            removed = report.removed_rows.len(),
            changed = report.changed_rows.len(),
            "diff reconciled"
        );
        Ok(report)
    }
}
