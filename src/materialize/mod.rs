use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::{Context, ContextVar};
use crate::error::{CtxDriftError, Result};
use crate::registry::{Materialization, Unit};
use crate::relation::{Relation, Value};
use crate::render::{QueryText, Renderer};
use crate::store::{Statement, TargetStore};

const WATERMARK_RETRIES: u32 = 3;
const WATERMARK_BACKOFF: Duration = Duration::from_millis(50);

/// Per-unit state machine for one build:
/// PENDING -> RENDERING -> EXECUTING -> {COMMITTED, FAILED}.
/// SKIPPED is assigned by the build runner when an upstream unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitState {
    Pending,
    Rendering,
    Executing,
    Committed,
    Failed,
    Skipped,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "PENDING",
            UnitState::Rendering => "RENDERING",
            UnitState::Executing => "EXECUTING",
            UnitState::Committed => "COMMITTED",
            UnitState::Failed => "FAILED",
            UnitState::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state and accounting for one unit in one build.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub state: UnitState,
    pub rows_written: u64,
    /// SHA-256 of the rendered query text, when rendering was reached.
    pub rendered_fingerprint: Option<String>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    /// For SKIPPED: the upstream unit whose failure propagated here.
    pub caused_by: Option<String>,
    /// Context variables the render consulted without declaring.
    pub leaked: Vec<ContextVar>,
}

impl UnitOutcome {
    pub fn skipped(unit: impl Into<String>, caused_by: impl Into<String>) -> Self {
        let caused_by = caused_by.into();
        Self {
            unit: unit.into(),
            state: UnitState::Skipped,
            rows_written: 0,
            rendered_fingerprint: None,
            elapsed_ms: 0,
            error: Some(format!("skipped due to upstream failure: {}", caused_by)),
            caused_by: Some(caused_by),
            leaked: Vec::new(),
        }
    }

    pub fn cancelled(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            state: UnitState::Skipped,
            rows_written: 0,
            rendered_fingerprint: None,
            elapsed_ms: 0,
            error: Some("build cancelled before unit started".to_string()),
            caused_by: None,
            leaked: Vec::new(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == UnitState::Committed
    }
}

struct Executed {
    rows_written: u64,
    fingerprint: String,
    leaked: Vec<ContextVar>,
}

/// Executes one unit's rendered query under its declared strategy. Always
/// stages the new result before touching the committed relation, so a
/// failure leaves the previous content intact.
pub struct Materializer {
    store: Arc<dyn TargetStore>,
}

impl Materializer {
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TargetStore> {
        &self.store
    }

    /// Run the state machine for one unit. Store-level failures produce a
    /// FAILED outcome; broken engine invariants (render nondeterminism,
    /// partial merge) abort the whole build as errors.
    pub async fn materialize(&self, unit: &Unit, ctx: &Context) -> Result<UnitOutcome> {
        let started = Instant::now();
        debug!(unit = %unit.name, "PENDING -> RENDERING");

        match self.run(unit, ctx).await {
            Ok(done) => {
                debug!(unit = %unit.name, rows = done.rows_written, "EXECUTING -> COMMITTED");
                Ok(UnitOutcome {
                    unit: unit.name.clone(),
                    state: UnitState::Committed,
                    rows_written: done.rows_written,
                    rendered_fingerprint: Some(done.fingerprint),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    error: None,
                    caused_by: None,
                    leaked: done.leaked,
                })
            }
            Err(
                fatal @ (CtxDriftError::RenderNondeterminism(_) | CtxDriftError::PartialMerge(_)),
            ) => Err(fatal),
            Err(e) => {
                warn!(unit = %unit.name, error = %e, "EXECUTING -> FAILED");
                Ok(UnitOutcome {
                    unit: unit.name.clone(),
                    state: UnitState::Failed,
                    rows_written: 0,
                    rendered_fingerprint: None,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    caused_by: None,
                    leaked: Vec::new(),
                })
            }
        }
    }

    async fn run(&self, unit: &Unit, ctx: &Context) -> Result<Executed> {
        let prior = self.store.read_relation(&unit.name).await?;
        let has_prior = prior.is_some();
        let unit_ctx = ctx.with_prior_output(has_prior);

        let watermark = match unit.materialization {
            Materialization::Incremental if has_prior => {
                self.read_watermark_with_retry(&unit.name, &unit.unique_key[0])
                    .await?
            }
            _ => None,
        };

        let rendered = Renderer::render(unit, &unit_ctx, watermark.as_ref())?;
        if rendered.has_leak() {
            // Reported, not fatal: the classifier downgrades this unit when
            // its outputs are compared.
            warn!(
                unit = %unit.name,
                variables = %rendered.leaked.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", "),
                "render consulted undeclared context variables"
            );
        }
        let fingerprint = rendered.text.fingerprint();
        debug!(unit = %unit.name, fingerprint = %fingerprint, "RENDERING -> EXECUTING");

        let rows_written = match unit.materialization {
            Materialization::View => {
                self.store
                    .execute(Statement::CreateOrReplaceView {
                        relation: unit.name.clone(),
                        query: rendered.text.clone(),
                    })
                    .await?
            }
            Materialization::Table => self.full_refresh(unit, &rendered.text).await?,
            Materialization::Incremental if !has_prior => {
                // First build: behave like a table over the full-range query.
                self.full_refresh(unit, &rendered.text).await?
            }
            Materialization::Incremental => self.merge_delta(unit, &rendered.text).await?,
        };

        Ok(Executed {
            rows_written,
            fingerprint,
            leaked: rendered.leaked,
        })
    }

    /// Evaluate the full query into a staged relation, then atomically
    /// replace the target. The committed relation is never mutated in place.
    async fn full_refresh(&self, unit: &Unit, sql: &QueryText) -> Result<u64> {
        let staged = self.store.query(sql).await?;
        self.store
            .execute(Statement::CreateOrReplaceTable {
                relation: unit.name.clone(),
                content: staged,
            })
            .await
    }

    /// Delete+insert merge over the delta's key range, inside one
    /// transaction so a concurrent reader sees either the pre-merge or
    /// post-merge state, never a partial delete.
    async fn merge_delta(&self, unit: &Unit, sql: &QueryText) -> Result<u64> {
        let delta = self.store.query(sql).await?;
        if delta.is_empty() {
            return Ok(0);
        }

        let key_column = &unit.unique_key[0];
        let (low, high) = Self::key_range(&delta, key_column)?;

        self.store.begin(&unit.name).await?;
        let merged: Result<u64> = async {
            self.store
                .execute(Statement::DeleteKeyRange {
                    relation: unit.name.clone(),
                    column: key_column.clone(),
                    low,
                    high,
                })
                .await?;
            self.store
                .execute(Statement::Insert {
                    relation: unit.name.clone(),
                    rows: delta.rows.clone(),
                })
                .await
        }
        .await;

        match merged {
            Ok(inserted) => {
                self.store.commit().await?;
                Ok(inserted)
            }
            Err(e) => {
                if self.store.rollback().await.is_err() {
                    // Neither pre- nor post-merge state can be guaranteed
                    // now; surface the integrity alarm instead of the
                    // original store error.
                    return Err(CtxDriftError::PartialMerge(unit.name.clone()));
                }
                Err(e)
            }
        }
    }

    fn key_range(delta: &Relation, key_column: &str) -> Result<(Value, Value)> {
        let idx = delta.column_index(key_column)?;
        let mut low: Option<Value> = None;
        let mut high: Option<Value> = None;
        for row in &delta.rows {
            let v = match row.get(idx) {
                Some(Value::Null) | None => continue,
                Some(v) => v,
            };
            if low
                .as_ref()
                .map_or(true, |l| v.partial_cmp_same(l) == Some(Ordering::Less))
            {
                low = Some(v.clone());
            }
            if high
                .as_ref()
                .map_or(true, |h| v.partial_cmp_same(h) == Some(Ordering::Greater))
            {
                high = Some(v.clone());
            }
        }
        match (low, high) {
            (Some(l), Some(h)) => Ok((l, h)),
            _ => Err(CtxDriftError::Store(format!(
                "delta carries no non-null '{}' key values",
                key_column
            ))),
        }
    }

    /// Watermark lookup is non-mutating, so transient store errors retry
    /// with backoff up to a small fixed count.
    async fn read_watermark_with_retry(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<Value>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.read_watermark(relation, column).await {
                Ok(wm) => return Ok(wm),
                Err(e) if attempt < WATERMARK_RETRIES => {
                    warn!(
                        relation,
                        attempt,
                        error = %e,
                        "watermark read failed; retrying"
                    );
                    tokio::time::sleep(WATERMARK_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
