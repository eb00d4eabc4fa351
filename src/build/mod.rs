use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::context::Context;
use crate::error::{CtxDriftError, Result};
use crate::materialize::{Materializer, UnitOutcome, UnitState};
use crate::registry::UnitRegistry;
use crate::store::TargetStore;

const DEFAULT_JOBS: usize = 4;

/// Cooperative cancellation flag. Honored at each unit's PENDING->RENDERING
/// boundary; a unit already executing runs to completion or failure.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-unit final states and timing for one build invocation, in the
/// deterministic topological order the build used.
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub environment: String,
    pub anchor_date: NaiveDate,
    pub outcomes: Vec<UnitOutcome>,
    pub elapsed_ms: u64,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state != UnitState::Failed)
    }

    pub fn failed(&self) -> Vec<&UnitOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == UnitState::Failed)
            .collect()
    }

    pub fn committed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_committed()).count()
    }

    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit == unit)
    }
}

/// Schedules one build: a bounded worker pool pulls ready units (all
/// dependencies COMMITTED) off a ready queue. Independent DAG branches run
/// in parallel; nothing blocks the pipeline except a direct dependency wait.
pub struct BuildRunner {
    registry: Arc<UnitRegistry>,
    materializer: Arc<Materializer>,
    jobs: usize,
    cancel: CancelToken,
}

impl BuildRunner {
    pub fn new(registry: Arc<UnitRegistry>, store: Arc<dyn TargetStore>) -> Self {
        Self {
            registry,
            materializer: Arc::new(Materializer::new(store)),
            jobs: DEFAULT_JOBS,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Build all units, or `selected` plus their transitive dependencies.
    /// Store-level unit failures land in the report; broken engine
    /// invariants abort with an error after in-flight units finish.
    pub async fn run_build(
        &self,
        ctx: &Context,
        selected: Option<&[String]>,
    ) -> Result<BuildReport> {
        let started = Instant::now();
        let topo = self.registry.resolve_order()?;
        let selection = self.selection_closure(selected)?;
        let order: Vec<String> = topo
            .into_iter()
            .filter(|n| selection.contains(n))
            .collect();

        info!(
            environment = %ctx.environment_name,
            anchor_date = %ctx.anchor_date,
            units = order.len(),
            jobs = self.jobs,
            "starting build"
        );

        let mut remaining: BTreeMap<String, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &order {
            let deps = self.registry.dependencies_of(name)?;
            let in_scope: Vec<&String> =
                deps.iter().filter(|d| selection.contains(*d)).collect();
            remaining.insert(name.clone(), in_scope.len());
            for dep in in_scope {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|n| remaining[*n] == 0)
            .cloned()
            .collect();
        let mut outcomes: BTreeMap<String, UnitOutcome> = BTreeMap::new();
        let mut upstream_failure: BTreeMap<String, String> = BTreeMap::new();
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut tasks: JoinSet<(String, Result<UnitOutcome>)> = JoinSet::new();
        let mut fatal: Option<CtxDriftError> = None;

        loop {
            while let Some(name) = ready.pop_front() {
                if self.cancel.is_cancelled() || fatal.is_some() {
                    let outcome = UnitOutcome::cancelled(&name);
                    Self::complete(
                        &dependents,
                        &mut remaining,
                        &mut upstream_failure,
                        &mut ready,
                        &mut outcomes,
                        outcome,
                    );
                    continue;
                }
                if let Some(cause) = upstream_failure.get(&name).cloned() {
                    let outcome = UnitOutcome::skipped(&name, cause);
                    Self::complete(
                        &dependents,
                        &mut remaining,
                        &mut upstream_failure,
                        &mut ready,
                        &mut outcomes,
                        outcome,
                    );
                    continue;
                }

                let unit = self.registry.get(&name)?;
                let materializer = self.materializer.clone();
                let permit_source = semaphore.clone();
                let cancel = self.cancel.clone();
                let task_ctx = ctx.clone();
                tasks.spawn(async move {
                    let _permit = permit_source
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    if cancel.is_cancelled() {
                        return (unit.name.clone(), Ok(UnitOutcome::cancelled(&unit.name)));
                    }
                    let result = materializer.materialize(&unit, &task_ctx).await;
                    (unit.name.clone(), result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, result) = joined
                .map_err(|e| CtxDriftError::Store(format!("unit task panicked: {e}")))?;
            match result {
                Ok(outcome) => Self::complete(
                    &dependents,
                    &mut remaining,
                    &mut upstream_failure,
                    &mut ready,
                    &mut outcomes,
                    outcome,
                ),
                Err(e) => {
                    // Reproducibility or merge-integrity violation: stop
                    // admitting new units, let in-flight ones finish, then
                    // surface the abort.
                    error!(unit = %name, error = %e, "fatal error; aborting build");
                    self.cancel.cancel();
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    let outcome = UnitOutcome::cancelled(&name);
                    Self::complete(
                        &dependents,
                        &mut remaining,
                        &mut upstream_failure,
                        &mut ready,
                        &mut outcomes,
                        outcome,
                    );
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let report = BuildReport {
            environment: ctx.environment_name.clone(),
            anchor_date: ctx.anchor_date,
            outcomes: order
                .iter()
                .filter_map(|n| outcomes.remove(n))
                .collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            committed = report.committed_count(),
            failed = report.failed().len(),
            elapsed_ms = report.elapsed_ms,
            "build finished"
        );
        Ok(report)
    }

    fn complete(
        dependents: &BTreeMap<String, Vec<String>>,
        remaining: &mut BTreeMap<String, usize>,
        upstream_failure: &mut BTreeMap<String, String>,
        ready: &mut VecDeque<String>,
        outcomes: &mut BTreeMap<String, UnitOutcome>,
        outcome: UnitOutcome,
    ) {
        let name = outcome.unit.clone();
        let committed = outcome.is_committed();
        outcomes.insert(name.clone(), outcome);

        if let Some(downstream) = dependents.get(&name) {
            for dependent in downstream {
                if !committed {
                    upstream_failure
                        .entry(dependent.clone())
                        .or_insert_with(|| name.clone());
                }
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent.clone());
                    }
                }
            }
        }
    }

    /// Selected units plus every transitive dependency; None selects all.
    fn selection_closure(&self, selected: Option<&[String]>) -> Result<BTreeSet<String>> {
        match selected {
            None => Ok(self.registry.units().map(|u| u.name.clone()).collect()),
            Some(names) => {
                let mut closure = BTreeSet::new();
                let mut queue: VecDeque<String> = names.iter().cloned().collect();
                while let Some(name) = queue.pop_front() {
                    if !self.registry.contains(&name) {
                        return Err(CtxDriftError::UnitNotFound(name));
                    }
                    if closure.insert(name.clone()) {
                        for dep in self.registry.dependencies_of(&name)? {
                            queue.push_back(dep.clone());
                        }
                    }
                }
                Ok(closure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RenderProbe;
    use crate::registry::{Materialization, Unit};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn ctx() -> Context {
        Context::new("dev", NaiveDate::from_ymd_opt(1998, 8, 2).unwrap())
    }

    fn table_unit(name: &str, deps: &[&str]) -> Unit {
        Unit::new(
            name,
            Materialization::Table,
            Arc::new(|_: &RenderProbe| "SELECT 1".to_string()),
        )
        .with_dependencies(deps.iter().copied())
    }

    fn registry(units: Vec<Unit>) -> Arc<UnitRegistry> {
        let mut reg = UnitRegistry::new();
        reg.register_all(units).unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn test_build_runs_all_units_in_order() {
        let reg = registry(vec![
            table_unit("staging", &[]),
            table_unit("mart", &["staging"]),
            table_unit("report", &["mart"]),
        ]);
        let runner = BuildRunner::new(reg, Arc::new(MemoryStore::mock()));

        let report = runner.run_build(&ctx(), None).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(
            report.outcomes.iter().map(|o| o.unit.as_str()).collect::<Vec<_>>(),
            vec!["staging", "mart", "report"]
        );
        assert_eq!(report.committed_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let failing_store = MemoryStore::with_evaluator(|sql, _| {
            if sql.as_str().contains("broken") {
                Err(CtxDriftError::Store("boom".into()))
            } else {
                Ok(crate::relation::Relation::default())
            }
        });
        let reg = registry(vec![
            Unit::new(
                "broken_src",
                Materialization::Table,
                Arc::new(|_: &RenderProbe| "broken".to_string()),
            ),
            table_unit("downstream", &["broken_src"]),
            table_unit("independent", &[]),
        ]);
        let runner = BuildRunner::new(reg, Arc::new(failing_store));

        let report = runner.run_build(&ctx(), None).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.outcome("broken_src").unwrap().state, UnitState::Failed);

        let skipped = report.outcome("downstream").unwrap();
        assert_eq!(skipped.state, UnitState::Skipped);
        assert_eq!(skipped.caused_by.as_deref(), Some("broken_src"));

        assert_eq!(
            report.outcome("independent").unwrap().state,
            UnitState::Committed
        );
    }

    #[tokio::test]
    async fn test_selection_includes_dependency_closure() {
        let reg = registry(vec![
            table_unit("base", &[]),
            table_unit("mid", &["base"]),
            table_unit("leaf", &["mid"]),
            table_unit("unrelated", &[]),
        ]);
        let runner = BuildRunner::new(reg, Arc::new(MemoryStore::mock()));

        let report = runner
            .run_build(&ctx(), Some(&["leaf".to_string()]))
            .await
            .unwrap();
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.unit.as_str()).collect();
        assert_eq!(names, vec!["base", "mid", "leaf"]);
    }

    #[tokio::test]
    async fn test_unknown_selection_fails() {
        let reg = registry(vec![table_unit("a", &[])]);
        let runner = BuildRunner::new(reg, Arc::new(MemoryStore::mock()));
        let err = runner
            .run_build(&ctx(), Some(&["missing".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CtxDriftError::UnitNotFound(_)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_build_skips_everything() {
        let reg = registry(vec![table_unit("a", &[]), table_unit("b", &["a"])]);
        let runner = BuildRunner::new(reg, Arc::new(MemoryStore::mock()));
        runner.cancel_token().cancel();

        let report = runner.run_build(&ctx(), None).await.unwrap();
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.state == UnitState::Skipped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mid_build_cancel_finishes_in_flight_unit() {
        // The evaluator signals once the first unit is executing, then
        // blocks until the test releases it.
        let (started_tx, started_rx) = std::sync::mpsc::sync_channel::<()>(1);
        let (release_tx, release_rx) = std::sync::mpsc::sync_channel::<()>(1);
        let release_rx = std::sync::Mutex::new(release_rx);
        let store = MemoryStore::with_evaluator(move |sql, _| {
            if sql.as_str() == "slow" {
                started_tx.send(()).ok();
                release_rx.lock().expect("release lock").recv().ok();
            }
            Ok(crate::relation::Relation::default())
        });
        let reg = registry(vec![
            Unit::new(
                "alpha_feed",
                Materialization::Table,
                Arc::new(|_: &RenderProbe| "slow".to_string()),
            ),
            table_unit("beta_report", &["alpha_feed"]),
        ]);
        let runner = Arc::new(BuildRunner::new(reg, Arc::new(store)));
        let cancel = runner.cancel_token();

        let build = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_build(&ctx(), None).await })
        };

        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        release_tx.send(()).unwrap();

        // The executing unit runs to completion; the queued dependent is
        // skipped at its scheduling boundary.
        let report = build.await.unwrap().unwrap();
        assert_eq!(
            report.outcome("alpha_feed").unwrap().state,
            UnitState::Committed
        );
        assert_eq!(
            report.outcome("beta_report").unwrap().state,
            UnitState::Skipped
        );
    }

    #[tokio::test]
    async fn test_render_nondeterminism_aborts_build() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let reg = registry(vec![Unit::new(
            "flaky",
            Materialization::Table,
            Arc::new(move |_: &RenderProbe| {
                format!(
                    "SELECT {}",
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                )
            }),
        )]);
        let runner = BuildRunner::new(reg, Arc::new(MemoryStore::mock()));

        let err = runner.run_build(&ctx(), None).await.unwrap_err();
        assert!(matches!(err, CtxDriftError::RenderNondeterminism(_)));
    }
}
