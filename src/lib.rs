pub mod error;
pub mod context;
pub mod relation;
pub mod registry;
pub mod render;
pub mod store;
pub mod materialize;
pub mod build;
pub mod classify;
pub mod reconcile;
pub mod dsl;

pub use error::{CtxDriftError, Result};
pub use context::{Context, ContextVar, RenderProbe};
pub use relation::{Relation, Row, Value};
pub use registry::{Materialization, RenderFn, Unit, UnitRegistry};
pub use render::{QueryTemplate, QueryText, Rendered, Renderer};
pub use store::{Catalog, Evaluator, FaultPoint, MemoryStore, Statement, TargetStore};
pub use materialize::{Materializer, UnitOutcome, UnitState};
pub use build::{BuildReport, BuildRunner, CancelToken};
pub use classify::{format_render_diff, Classification, Classifier, Verdict};
pub use reconcile::{ChangedRow, DiffReconciler, DiffReport, DiffRunner, Severity};
pub use dsl::{RawUnitDef, UnitDef, UnitLoader, UnitValidator, ValidationResult};
